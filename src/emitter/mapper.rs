//! Cartridge mappers
//!
//! NROM for songs that fit 32 KiB, MMC1 with 128 KiB PRG for everything
//! else. Each mapper knows its iNES header, linker script, init code and
//! data capacity; the MMC1 control value is derived from the bank mode
//! and checked against the emitted bank count rather than hard-coded.

use crate::error::{Error, Result};

pub const PRG_BANK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapper {
    Nrom,
    Mmc1,
}

impl Mapper {
    pub fn name(self) -> &'static str {
        match self {
            Mapper::Nrom => "NROM",
            Mapper::Mmc1 => "MMC1",
        }
    }

    pub fn mapper_number(self) -> u8 {
        match self {
            Mapper::Nrom => 0,
            Mapper::Mmc1 => 1,
        }
    }

    pub fn prg_banks(self) -> u8 {
        match self {
            Mapper::Nrom => 2,
            Mapper::Mmc1 => 8,
        }
    }

    pub fn prg_rom_size(self) -> usize {
        usize::from(self.prg_banks()) * PRG_BANK_SIZE
    }

    /// Bytes available to music data after the fixed driver bank.
    pub fn data_capacity(self) -> usize {
        match self {
            // 32 KiB minus the driver/vector bank share.
            Mapper::Nrom => 24 * 1024,
            // Seven switchable 16 KiB banks.
            Mapper::Mmc1 => 112 * 1024,
        }
    }

    /// MMC1 control register value for a PRG bank count: `$0A` selects
    /// 32 KiB PRG mode, `$0C` the 16 KiB fixed-last-bank mode. Returns
    /// an invariant error when the bank count does not match the mode
    /// the caller is emitting for.
    pub fn verified_control(self, prg_banks: u8) -> Result<u8> {
        match self {
            Mapper::Nrom => Err(Error::InternalInvariant {
                stage: "emit",
                message: "NROM has no control register".to_string(),
            }),
            Mapper::Mmc1 => {
                if prg_banks != self.prg_banks() {
                    return Err(Error::InternalInvariant {
                        stage: "emit",
                        message: format!(
                            "MMC1 configured for {} banks but emitting {}",
                            self.prg_banks(),
                            prg_banks
                        ),
                    });
                }
                Ok(if prg_banks <= 2 { 0x0A } else { 0x0C })
            }
        }
    }

    /// iNES header bytes as a `.segment "HEADER"` block.
    pub fn header_asm(self) -> String {
        let chr_comment = match self {
            Mapper::Nrom => "no CHR ROM, CHR-RAM on the board",
            Mapper::Mmc1 => "CHR-RAM",
        };
        format!(
            ".segment \"HEADER\"\n\
             \x20   .byte \"NES\", $1A\n\
             \x20   .byte ${banks:02X}             ; {banks} x 16KB PRG ROM\n\
             \x20   .byte $00             ; {chr}\n\
             \x20   .byte ${flags6:02X}             ; mapper {num}, horizontal mirroring\n\
             \x20   .byte $00\n\
             \x20   .byte $00, $00, $00, $00, $00, $00, $00, $00\n",
            banks = self.prg_banks(),
            chr = chr_comment,
            flags6 = self.mapper_number() << 4,
            num = self.mapper_number(),
        )
    }

    /// ld65 configuration for the cartridge layout.
    pub fn linker_config(self) -> String {
        match self {
            Mapper::Nrom => "\
MEMORY {
    ZP:      start = $0000, size = $0100, type = rw, define = yes;
    RAM:     start = $0300, size = $0500, type = rw, define = yes;
    HEADER:  start = $0000, size = $0010, file = %O, fill = yes;
    PRG:     start = $8000, size = $7FFA, file = %O, fill = yes, fillval = $FF;
    VECTORS: start = $FFFA, size = $0006, file = %O, fill = yes;
}

SEGMENTS {
    HEADER:   load = HEADER, type = ro;
    ZEROPAGE: load = ZP,     type = zp;
    BSS:      load = RAM,    type = bss;
    CODE:     load = PRG,    type = ro;
    RODATA:   load = PRG,    type = ro;
    VECTORS:  load = VECTORS, type = ro;
}
"
            .to_string(),
            Mapper::Mmc1 => "\
MEMORY {
    ZP:       start = $0000, size = $0100, type = rw, define = yes;
    RAM:      start = $0300, size = $0500, type = rw, define = yes;
    HEADER:   start = $0000, size = $0010, file = %O, fill = yes;

    # Switchable banks 0-6, visible at $8000-$BFFF
    PRGSWAP:  start = $8000, size = $1C000, file = %O, fill = yes, fillval = $FF;

    # Fixed bank 7, always mapped at $C000-$FFFF
    PRGFIXED: start = $C000, size = $3FFA, file = %O, fill = yes, fillval = $FF;
    VECTORS: start = $FFFA, size = $0006, file = %O, fill = yes;
}

SEGMENTS {
    HEADER:   load = HEADER,   type = ro;
    ZEROPAGE: load = ZP,       type = zp;
    BSS:      load = RAM,      type = bss;
    RODATA:   load = PRGSWAP,  type = ro;
    CODE:     load = PRGFIXED, type = ro;
    VECTORS:  load = VECTORS,  type = ro;
}
"
            .to_string(),
        }
    }

    /// Reset-time mapper initialisation.
    pub fn init_asm(self) -> Result<String> {
        match self {
            Mapper::Nrom => Ok(String::new()),
            Mapper::Mmc1 => {
                let control = self.verified_control(self.prg_banks())?;
                Ok(format!(
                    "    ; MMC1 init: reset the shift register, then load control\n\
                     \x20   lda #$80\n\
                     \x20   sta $8000\n\
                     \x20   lda #${control:02X}\n\
                     \x20   jsr mmc1_write_control\n\
                     \x20   lda #$00\n\
                     \x20   jsr mmc1_write_prg_bank\n"
                ))
            }
        }
    }

    /// Serial-port style register write helpers, MMC1 only.
    pub fn support_routines(self) -> &'static str {
        match self {
            Mapper::Nrom => "",
            Mapper::Mmc1 => "\
mmc1_write_control:
    sta $8000
    lsr a
    sta $8000
    lsr a
    sta $8000
    lsr a
    sta $8000
    lsr a
    sta $8000
    rts

mmc1_write_prg_bank:
    sta $E000
    lsr a
    sta $E000
    lsr a
    sta $E000
    lsr a
    sta $E000
    lsr a
    sta $E000
    rts
",
        }
    }
}
