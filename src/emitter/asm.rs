//! CA65 assembly generation
//!
//! Serialises a `SongModule` into one assembly file: iNES header, data
//! tables in RODATA, and a driver that decodes the reference/residual
//! lists at every NMI and rewrites the APU registers.
//!
//! Runtime cell format is three bytes per frame: note byte ($FF when
//! silent), control byte, flags (bit 0 = retrigger). Melodic channels
//! store the MIDI note and the driver looks the timer up in the in-ROM
//! pitch table, which keeps reference transpose deltas a single indexed
//! add.

use crate::dpcm::DpcmIndex;
use crate::error::{Error, Result};
use crate::nes::pitch_table::{timer_for, PULSE_TIMERS, TRIANGLE_TIMERS};
use crate::nes::{Channel, FrameCell, NOTE_NONE};
use crate::tracker::pattern::SongModule;

use super::mapper::Mapper;

/// Frame ceiling that keeps every list delta clear of the $FFFF
/// sentinel.
pub const MAX_FRAMES: u32 = 0xFE00;

/// Rough driver + reset footprint, counted against PRG capacity.
pub const DRIVER_CODE_BYTES: usize = 2048;

const REF_RECORD_BYTES: usize = 5;
const RES_RECORD_BYTES: usize = 5;
const CELL_BYTES: usize = 3;
const SENTINEL_BYTES: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct EmitOptions {
    pub mapper: Mapper,
    pub debug_overlay: bool,
}

/// Encode one frame cell into its three-byte runtime record.
pub fn encode_cell(cell: &FrameCell) -> [u8; CELL_BYTES] {
    [
        cell.note.unwrap_or(NOTE_NONE),
        cell.control,
        u8::from(cell.retrigger),
    ]
}

/// Decode a runtime record back into a frame cell. Inverse of
/// `encode_cell` for cells produced by the frame generator.
pub fn decode_cell(channel: Channel, bytes: [u8; CELL_BYTES]) -> FrameCell {
    let note = (bytes[0] != NOTE_NONE).then_some(bytes[0]);
    let control = bytes[1];
    let (volume, timer) = match (channel, note) {
        (_, None) => (0, 0),
        (Channel::Pulse1 | Channel::Pulse2, Some(n)) => {
            (control & 0x0F, timer_for(channel, n))
        }
        (Channel::Triangle, Some(n)) => (15, timer_for(channel, n)),
        (Channel::Noise, Some(n)) => (control & 0x0F, u16::from(n)),
        (Channel::Dpcm, Some(_)) => (0, u16::from(control)),
    };
    FrameCell {
        note,
        volume,
        timer,
        control,
        retrigger: bytes[2] & 0x01 != 0,
    }
}

/// Reference list records: start-frame deltas against the previous
/// record's start, then id, transpose, volume delta.
pub fn ref_record_bytes(refs: &[crate::tracker::pattern::PatternReference]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(refs.len() * REF_RECORD_BYTES + SENTINEL_BYTES);
    let mut prev_start = 0u32;
    for reference in refs {
        let delta = (reference.frame - prev_start) as u16;
        prev_start = reference.frame;
        bytes.extend_from_slice(&delta.to_le_bytes());
        bytes.push(reference.pattern_id as u8);
        bytes.push(reference.transpose as u8);
        bytes.push(reference.volume_delta as u8);
    }
    bytes.extend_from_slice(&[0xFF, 0xFF]);
    bytes
}

/// Residual list records: frame delta then the raw cell.
pub fn res_record_bytes(residual: &[(u32, FrameCell)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(residual.len() * RES_RECORD_BYTES + SENTINEL_BYTES);
    let mut prev_frame = 0u32;
    for (frame, cell) in residual {
        let delta = (frame - prev_frame) as u16;
        prev_frame = *frame;
        bytes.extend_from_slice(&delta.to_le_bytes());
        bytes.extend_from_slice(&encode_cell(cell));
    }
    bytes.extend_from_slice(&[0xFF, 0xFF]);
    bytes
}

/// Total RODATA bytes the module will occupy.
pub fn data_size(module: &SongModule, dpcm_index: Option<&DpcmIndex>) -> usize {
    let pattern_cells: usize = module.library.iter().map(|p| p.len()).sum();
    let refs: usize = module.channels.iter().map(|c| c.refs.len()).sum();
    let residual: usize = module.channels.iter().map(|c| c.residual.len()).sum();
    let dpcm_slots = dpcm_index
        .map(|index| index.slots().map(|(slot, _)| usize::from(slot) + 1).max().unwrap_or(0))
        .unwrap_or(0)
        .max(1);
    let header = 26;
    let pitch_tables = 4 * 128;
    let pattern_tables = module.library.len().max(1) * 3;
    header
        + pitch_tables
        + dpcm_slots * 2
        + pattern_cells * CELL_BYTES
        + pattern_tables
        + refs * REF_RECORD_BYTES
        + residual * RES_RECORD_BYTES
        + Channel::ALL.len() * 2 * SENTINEL_BYTES
}

struct AsmWriter {
    out: String,
}

impl AsmWriter {
    fn new() -> Self {
        Self { out: String::new() }
    }

    fn line(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn byte_rows(&mut self, bytes: &[u8]) {
        for row in bytes.chunks(16) {
            let values: Vec<String> = row.iter().map(|b| format!("${:02X}", b)).collect();
            self.line(&format!("    .byte {}", values.join(", ")));
        }
    }
}

/// Per-channel driver parameters: zeropage prefix, register addresses
/// and the pitch table to index.
struct ChannelParams {
    channel: Channel,
    prefix: &'static str,
    ctrl: u16,
    lo: u16,
    hi: u16,
    table: &'static str,
}

fn channel_params(channel: Channel) -> ChannelParams {
    match channel {
        Channel::Pulse1 => ChannelParams {
            channel,
            prefix: "p1_",
            ctrl: 0x4000,
            lo: 0x4002,
            hi: 0x4003,
            table: "note",
        },
        Channel::Pulse2 => ChannelParams {
            channel,
            prefix: "p2_",
            ctrl: 0x4004,
            lo: 0x4006,
            hi: 0x4007,
            table: "note",
        },
        Channel::Triangle => ChannelParams {
            channel,
            prefix: "tri_",
            ctrl: 0x4008,
            lo: 0x400A,
            hi: 0x400B,
            table: "tri",
        },
        Channel::Noise => ChannelParams {
            channel,
            prefix: "noi_",
            ctrl: 0x400C,
            lo: 0x400E,
            hi: 0x400F,
            table: "",
        },
        Channel::Dpcm => ChannelParams {
            channel,
            prefix: "dmc_",
            ctrl: 0x4010,
            lo: 0x4012,
            hi: 0x4013,
            table: "",
        },
    }
}

/// Emit the complete assembly source for a song module.
pub fn emit_assembly(
    module: &SongModule,
    dpcm_index: Option<&DpcmIndex>,
    options: &EmitOptions,
) -> Result<String> {
    if module.total_frames > MAX_FRAMES {
        return Err(Error::InvalidInput(format!(
            "song is {} frames; the driver addresses at most {}",
            module.total_frames, MAX_FRAMES
        )));
    }
    if module.library.len() > 256 {
        return Err(Error::RomSizeExceeded {
            mapper: options.mapper.name(),
            got: module.library.len(),
            capacity: 256,
        });
    }

    let mut w = AsmWriter::new();
    w.line("; Generated by midi2nes. One NMI per frame drives the APU.");
    w.blank();
    w.out.push_str(&options.mapper.header_asm());
    w.blank();

    emit_zeropage(&mut w);
    emit_code(&mut w, module, options)?;
    emit_rodata(&mut w, module, dpcm_index);

    w.line(".segment \"VECTORS\"");
    w.line("    .word nmi");
    w.line("    .word reset");
    w.line("    .word irq");
    Ok(w.out)
}

fn emit_zeropage(w: &mut AsmWriter) {
    w.line(".segment \"ZEROPAGE\"");
    for name in [
        "frame_lo", "frame_hi", "song_done", "tmp_note", "tmp_ctrl", "tmp_flags", "tmp_lo",
        "tmp_hi", "tmp_transpose", "tmp_voldelta",
    ] {
        w.line(&format!("{:<16}.res 1", format!("{}:", name)));
    }
    for channel in Channel::ALL {
        let p = channel_params(channel).prefix;
        for (name, size) in [
            ("ref_ptr", 2),
            ("ref_frame", 2),
            ("next_id", 1),
            ("transpose", 1),
            ("voldelta", 1),
            ("pat_ptr", 2),
            ("pat_rem", 1),
            ("res_ptr", 2),
            ("res_frame", 2),
        ] {
            w.line(&format!("{:<16}.res {}", format!("{}{}:", p, name), size));
        }
    }
    w.blank();
}

fn emit_code(w: &mut AsmWriter, module: &SongModule, options: &EmitOptions) -> Result<()> {
    let total = module.total_frames.max(1);
    w.line(".segment \"CODE\"");
    w.blank();

    // Reset handler: mapper init, RAM clear, PPU warmup, NMI on.
    w.line("reset:");
    w.line("    sei");
    w.line("    cld");
    w.line("    ldx #$FF");
    w.line("    txs");
    w.line("    inx");
    w.line("    stx $2000");
    w.line("    stx $2001");
    w.out.push_str(&options.mapper.init_asm()?);
    w.line("    bit $2002");
    w.line("@vblank1:");
    w.line("    bit $2002");
    w.line("    bpl @vblank1");
    w.line("    lda #$00");
    w.line("    tax");
    w.line("@clear_ram:");
    w.line("    sta $0000,x");
    w.line("    sta $0100,x");
    w.line("    sta $0200,x");
    w.line("    sta $0300,x");
    w.line("    sta $0400,x");
    w.line("    sta $0500,x");
    w.line("    sta $0600,x");
    w.line("    sta $0700,x");
    w.line("    inx");
    w.line("    bne @clear_ram");
    w.line("@vblank2:");
    w.line("    bit $2002");
    w.line("    bpl @vblank2");
    w.line("    jsr init_music");
    w.line("    lda #$80");
    w.line("    sta $2000");
    w.line("@idle:");
    w.line("    jmp @idle");
    w.blank();

    // NMI: one frame of playback, then the end-of-song check.
    w.line("nmi:");
    w.line("    pha");
    w.line("    txa");
    w.line("    pha");
    w.line("    tya");
    w.line("    pha");
    w.line("    lda song_done");
    w.line("    bne @out");
    w.line("    jsr update_music");
    if options.debug_overlay {
        w.line("    jsr debug_overlay");
    }
    w.line("    inc frame_lo");
    w.line("    bne @endcheck");
    w.line("    inc frame_hi");
    w.line("@endcheck:");
    w.line("    lda frame_lo");
    w.line(&format!("    cmp #<{}", total));
    w.line("    bne @out");
    w.line("    lda frame_hi");
    w.line(&format!("    cmp #>{}", total));
    w.line("    bne @out");
    if module.loop_frame.is_some() {
        w.line("    jsr init_music");
    } else {
        w.line("    lda #$01");
        w.line("    sta song_done");
        w.line("    lda #$30");
        w.line("    sta $4000");
        w.line("    sta $4004");
        w.line("    sta $400C");
        w.line("    lda #$00");
        w.line("    sta $4008");
        w.line("    sta $4015");
    }
    w.line("@out:");
    w.line("    pla");
    w.line("    tay");
    w.line("    pla");
    w.line("    tax");
    w.line("    pla");
    w.line("    rti");
    w.blank();

    w.line("irq:");
    w.line("    rti");
    w.blank();

    emit_init_music(w);
    emit_update_music(w);
    for channel in Channel::ALL {
        emit_channel_driver(w, &channel_params(channel));
    }
    if options.debug_overlay {
        emit_debug_overlay(w);
    }
    w.out.push_str(options.mapper.support_routines());
    w.blank();
    Ok(())
}

fn emit_init_music(w: &mut AsmWriter) {
    w.line("init_music:");
    w.line("    lda #$00");
    w.line("    sta frame_lo");
    w.line("    sta frame_hi");
    w.line("    sta song_done");
    w.line("    lda #$0F");
    w.line("    sta $4015");
    w.line("    lda #$40");
    w.line("    sta $4017");
    for (i, channel) in Channel::ALL.into_iter().enumerate() {
        let p = channel_params(channel).prefix;
        let base = i * 4;
        w.line(&format!("    lda song_header+{}", base));
        w.line(&format!("    sta {}ref_ptr", p));
        w.line(&format!("    lda song_header+{}", base + 1));
        w.line(&format!("    sta {}ref_ptr+1", p));
        w.line(&format!("    lda song_header+{}", base + 2));
        w.line(&format!("    sta {}res_ptr", p));
        w.line(&format!("    lda song_header+{}", base + 3));
        w.line(&format!("    sta {}res_ptr+1", p));
        w.line("    lda #$00");
        for field in ["ref_frame", "ref_frame+1", "res_frame", "res_frame+1", "pat_rem", "transpose", "voldelta"] {
            w.line(&format!("    sta {}{}", p, field));
        }
        w.line(&format!("    jsr {}next_ref", p));
        w.line(&format!("    jsr {}next_res", p));
    }
    w.line("    rts");
    w.blank();
}

fn emit_update_music(w: &mut AsmWriter) {
    w.line("update_music:");
    for channel in Channel::ALL {
        w.line(&format!("    jsr update_{}", channel.name()));
    }
    w.line("    rts");
    w.blank();
}

fn emit_channel_driver(w: &mut AsmWriter, params: &ChannelParams) {
    let p = params.prefix;
    let name = params.channel.name();

    w.line(&format!("update_{}:", name));
    w.line(&format!("    lda {}pat_rem", p));
    w.line("    bne @emit");
    w.line(&format!("    lda {}ref_frame", p));
    w.line("    cmp frame_lo");
    w.line("    bne @residual");
    w.line(&format!("    lda {}ref_frame+1", p));
    w.line("    cmp frame_hi");
    w.line("    bne @residual");
    w.line(&format!("    jsr {}begin_pattern", p));
    w.line("@emit:");
    w.line(&format!("    jsr {}emit_cell", p));
    w.line(&format!("    dec {}pat_rem", p));
    w.line("    bne @done");
    w.line(&format!("    jsr {}next_ref", p));
    w.line("@done:");
    w.line("    rts");
    w.line("@residual:");
    w.line(&format!("    lda {}res_frame", p));
    w.line("    cmp frame_lo");
    w.line("    bne @idle");
    w.line(&format!("    lda {}res_frame+1", p));
    w.line("    cmp frame_hi");
    w.line("    bne @idle");
    w.line(&format!("    jmp {}emit_res", p));
    w.line("@idle:");
    w.line("    rts");
    w.blank();

    w.line(&format!("{}begin_pattern:", p));
    w.line(&format!("    ldx {}next_id", p));
    w.line("    lda pattern_ptrs_lo,x");
    w.line(&format!("    sta {}pat_ptr", p));
    w.line("    lda pattern_ptrs_hi,x");
    w.line(&format!("    sta {}pat_ptr+1", p));
    w.line("    lda pattern_lens,x");
    w.line(&format!("    sta {}pat_rem", p));
    w.line("    rts");
    w.blank();

    // Load the next reference record; $FFFF delta parks the channel.
    w.line(&format!("{}next_ref:", p));
    w.line("    ldy #$00");
    w.line(&format!("    lda ({}ref_ptr),y", p));
    w.line("    sta tmp_lo");
    w.line("    iny");
    w.line(&format!("    lda ({}ref_ptr),y", p));
    w.line("    sta tmp_hi");
    w.line("    and tmp_lo");
    w.line("    cmp #$FF");
    w.line("    bne @advance");
    w.line("    lda #$FF");
    w.line(&format!("    sta {}ref_frame", p));
    w.line(&format!("    sta {}ref_frame+1", p));
    w.line("    rts");
    w.line("@advance:");
    w.line("    clc");
    w.line(&format!("    lda {}ref_frame", p));
    w.line("    adc tmp_lo");
    w.line(&format!("    sta {}ref_frame", p));
    w.line(&format!("    lda {}ref_frame+1", p));
    w.line("    adc tmp_hi");
    w.line(&format!("    sta {}ref_frame+1", p));
    w.line("    iny");
    w.line(&format!("    lda ({}ref_ptr),y", p));
    w.line(&format!("    sta {}next_id", p));
    w.line("    iny");
    w.line(&format!("    lda ({}ref_ptr),y", p));
    w.line(&format!("    sta {}transpose", p));
    w.line("    iny");
    w.line(&format!("    lda ({}ref_ptr),y", p));
    w.line(&format!("    sta {}voldelta", p));
    w.line("    clc");
    w.line(&format!("    lda {}ref_ptr", p));
    w.line("    adc #$05");
    w.line(&format!("    sta {}ref_ptr", p));
    w.line(&format!("    lda {}ref_ptr+1", p));
    w.line("    adc #$00");
    w.line(&format!("    sta {}ref_ptr+1", p));
    w.line("    rts");
    w.blank();

    w.line(&format!("{}next_res:", p));
    w.line("    ldy #$00");
    w.line(&format!("    lda ({}res_ptr),y", p));
    w.line("    sta tmp_lo");
    w.line("    iny");
    w.line(&format!("    lda ({}res_ptr),y", p));
    w.line("    sta tmp_hi");
    w.line("    and tmp_lo");
    w.line("    cmp #$FF");
    w.line("    bne @advance");
    w.line("    lda #$FF");
    w.line(&format!("    sta {}res_frame", p));
    w.line(&format!("    sta {}res_frame+1", p));
    w.line("    rts");
    w.line("@advance:");
    w.line("    clc");
    w.line(&format!("    lda {}res_frame", p));
    w.line("    adc tmp_lo");
    w.line(&format!("    sta {}res_frame", p));
    w.line(&format!("    lda {}res_frame+1", p));
    w.line("    adc tmp_hi");
    w.line(&format!("    sta {}res_frame+1", p));
    w.line("    clc");
    w.line(&format!("    lda {}res_ptr", p));
    w.line("    adc #$02");
    w.line(&format!("    sta {}res_ptr", p));
    w.line(&format!("    lda {}res_ptr+1", p));
    w.line("    adc #$00");
    w.line(&format!("    sta {}res_ptr+1", p));
    w.line("    rts");
    w.blank();

    w.line(&format!("{}emit_cell:", p));
    w.line(&format!("    lda {}transpose", p));
    w.line("    sta tmp_transpose");
    w.line(&format!("    lda {}voldelta", p));
    w.line("    sta tmp_voldelta");
    w.line("    ldy #$00");
    w.line(&format!("    lda ({}pat_ptr),y", p));
    w.line("    sta tmp_note");
    w.line("    iny");
    w.line(&format!("    lda ({}pat_ptr),y", p));
    w.line("    sta tmp_ctrl");
    w.line("    iny");
    w.line(&format!("    lda ({}pat_ptr),y", p));
    w.line("    sta tmp_flags");
    w.line("    clc");
    w.line(&format!("    lda {}pat_ptr", p));
    w.line("    adc #$03");
    w.line(&format!("    sta {}pat_ptr", p));
    w.line(&format!("    lda {}pat_ptr+1", p));
    w.line("    adc #$00");
    w.line(&format!("    sta {}pat_ptr+1", p));
    w.line(&format!("    jmp {}write_cell", p));
    w.blank();

    // Residual cells are raw: no transpose, no volume delta.
    w.line(&format!("{}emit_res:", p));
    w.line("    lda #$00");
    w.line("    sta tmp_transpose");
    w.line("    sta tmp_voldelta");
    w.line("    ldy #$00");
    w.line(&format!("    lda ({}res_ptr),y", p));
    w.line("    sta tmp_note");
    w.line("    iny");
    w.line(&format!("    lda ({}res_ptr),y", p));
    w.line("    sta tmp_ctrl");
    w.line("    iny");
    w.line(&format!("    lda ({}res_ptr),y", p));
    w.line("    sta tmp_flags");
    w.line("    clc");
    w.line(&format!("    lda {}res_ptr", p));
    w.line("    adc #$03");
    w.line(&format!("    sta {}res_ptr", p));
    w.line(&format!("    lda {}res_ptr+1", p));
    w.line("    adc #$00");
    w.line(&format!("    sta {}res_ptr+1", p));
    w.line(&format!("    jsr {}write_cell", p));
    w.line(&format!("    jmp {}next_res", p));
    w.blank();

    emit_write_cell(w, params);
}

fn emit_write_cell(w: &mut AsmWriter, params: &ChannelParams) {
    let p = params.prefix;
    w.line(&format!("{}write_cell:", p));
    match params.channel {
        Channel::Pulse1 | Channel::Pulse2 | Channel::Triangle => {
            w.line("    lda tmp_note");
            w.line("    cmp #$FF");
            w.line("    bne @tone");
            w.line("    lda tmp_ctrl");
            w.line(&format!("    sta ${:04X}", params.ctrl));
            w.line("    rts");
            w.line("@tone:");
            w.line("    clc");
            w.line("    adc tmp_transpose");
            w.line("    tax");
            if params.channel.has_volume_control() {
                w.line("    lda tmp_voldelta");
                w.line("    beq @vol_done");
                w.line("    clc");
                w.line("    adc tmp_ctrl");
                w.line("    sta tmp_ctrl");
                w.line("@vol_done:");
            }
            // Fixed write order: timer-low, timer-high (with length
            // reload) on retrigger only, control last.
            w.line(&format!("    lda {}_lo,x", params.table));
            w.line(&format!("    sta ${:04X}", params.lo));
            w.line("    lda tmp_flags");
            w.line("    and #$01");
            w.line("    beq @ctrl");
            w.line(&format!("    lda {}_hi,x", params.table));
            w.line("    ora #$F8");
            w.line(&format!("    sta ${:04X}", params.hi));
            w.line("@ctrl:");
            w.line("    lda tmp_ctrl");
            w.line(&format!("    sta ${:04X}", params.ctrl));
            w.line("    rts");
        }
        Channel::Noise => {
            w.line("    lda tmp_note");
            w.line("    cmp #$FF");
            w.line("    bne @tone");
            w.line("    lda tmp_ctrl");
            w.line("    sta $400C");
            w.line("    rts");
            w.line("@tone:");
            w.line("    sta $400E");
            w.line("    lda tmp_voldelta");
            w.line("    beq @vol_done");
            w.line("    clc");
            w.line("    adc tmp_ctrl");
            w.line("    sta tmp_ctrl");
            w.line("@vol_done:");
            w.line("    lda tmp_flags");
            w.line("    and #$01");
            w.line("    beq @ctrl");
            w.line("    lda #$F8");
            w.line("    sta $400F");
            w.line("@ctrl:");
            w.line("    lda tmp_ctrl");
            w.line("    sta $400C");
            w.line("    rts");
        }
        Channel::Dpcm => {
            // A silent cell leaves a playing sample alone; a trigger
            // restarts the DPCM unit with the slot's address and length.
            w.line("    lda tmp_note");
            w.line("    cmp #$FF");
            w.line("    bne @trigger");
            w.line("    rts");
            w.line("@trigger:");
            w.line("    tax");
            w.line("    lda #$0F");
            w.line("    sta $4015");
            w.line("    lda tmp_ctrl");
            w.line("    sta $4010");
            w.line("    lda dpcm_addr_table,x");
            w.line("    sta $4012");
            w.line("    lda dpcm_len_table,x");
            w.line("    sta $4013");
            w.line("    lda #$1F");
            w.line("    sta $4015");
            w.line("    rts");
        }
    }
    w.blank();
}

/// Text-mode channel activity indicators plus a hex frame counter.
/// Pure add-on; it touches only PPU registers, after the APU writes.
fn emit_debug_overlay(w: &mut AsmWriter) {
    w.line("debug_overlay:");
    w.line("    bit $2002");
    w.line("    lda #$20");
    w.line("    sta $2006");
    w.line("    lda #$42");
    w.line("    sta $2006");
    for channel in Channel::ALL {
        let p = channel_params(channel).prefix;
        w.line(&format!("    lda {}pat_rem", p));
        w.line(&format!("    beq @{}off", p));
        w.line("    lda #$2A");
        w.line(&format!("    bne @{}put", p));
        w.line(&format!("@{}off:", p));
        w.line("    lda #$2D");
        w.line(&format!("@{}put:", p));
        w.line("    sta $2007");
    }
    w.line("    lda frame_hi");
    w.line("    jsr put_hex_byte");
    w.line("    lda frame_lo");
    w.line("    jsr put_hex_byte");
    w.line("    lda #$00");
    w.line("    sta $2005");
    w.line("    sta $2005");
    w.line("    rts");
    w.blank();

    w.line("put_hex_byte:");
    w.line("    pha");
    w.line("    lsr a");
    w.line("    lsr a");
    w.line("    lsr a");
    w.line("    lsr a");
    w.line("    jsr put_hex_digit");
    w.line("    pla");
    w.line("    and #$0F");
    w.line("put_hex_digit:");
    w.line("    cmp #$0A");
    w.line("    bcc @digit");
    w.line("    adc #$06");
    w.line("@digit:");
    w.line("    adc #$30");
    w.line("    sta $2007");
    w.line("    rts");
    w.blank();
}

fn emit_rodata(w: &mut AsmWriter, module: &SongModule, dpcm_index: Option<&DpcmIndex>) {
    w.line(".segment \"RODATA\"");
    w.blank();

    // Header table: per-channel list pointers, then the pattern tables.
    w.line("song_header:");
    for channel in Channel::ALL {
        w.line(&format!("    .word {}_refs", channel.name()));
        w.line(&format!("    .word {}_residual", channel.name()));
    }
    w.line("    .word pattern_ptrs_lo");
    w.line("    .word pattern_ptrs_hi");
    w.line("    .word pattern_lens");
    w.blank();

    // NTSC pitch tables, indexed by MIDI note.
    let lo_bytes = |table: &[u16; 128]| -> Vec<u8> { table.iter().map(|&t| (t & 0xFF) as u8).collect() };
    let hi_bytes = |table: &[u16; 128]| -> Vec<u8> { table.iter().map(|&t| (t >> 8) as u8).collect() };
    w.line("note_lo:");
    w.byte_rows(&lo_bytes(&PULSE_TIMERS));
    w.line("note_hi:");
    w.byte_rows(&hi_bytes(&PULSE_TIMERS));
    w.line("tri_lo:");
    w.byte_rows(&lo_bytes(&TRIANGLE_TIMERS));
    w.line("tri_hi:");
    w.byte_rows(&hi_bytes(&TRIANGLE_TIMERS));
    w.blank();

    emit_dpcm_tables(w, dpcm_index);

    // Pattern library.
    for pattern in module.library.iter() {
        w.line(&format!("pattern_{}:", pattern.id));
        let bytes: Vec<u8> = pattern.cells.iter().flat_map(|c| encode_cell(c)).collect();
        w.byte_rows(&bytes);
    }
    if module.library.is_empty() {
        w.line("pattern_ptrs_lo:");
        w.line("    .byte $00");
        w.line("pattern_ptrs_hi:");
        w.line("    .byte $00");
        w.line("pattern_lens:");
        w.line("    .byte $00");
    } else {
        let names: Vec<String> = module
            .library
            .iter()
            .map(|p| format!("pattern_{}", p.id))
            .collect();
        w.line("pattern_ptrs_lo:");
        for chunk in names.chunks(8) {
            let lobytes: Vec<String> = chunk.iter().map(|n| format!("<{}", n)).collect();
            w.line(&format!("    .byte {}", lobytes.join(", ")));
        }
        w.line("pattern_ptrs_hi:");
        for chunk in names.chunks(8) {
            let hibytes: Vec<String> = chunk.iter().map(|n| format!(">{}", n)).collect();
            w.line(&format!("    .byte {}", hibytes.join(", ")));
        }
        w.line("pattern_lens:");
        let lens: Vec<u8> = module.library.iter().map(|p| p.len() as u8).collect();
        w.byte_rows(&lens);
    }
    w.blank();

    // Reference and residual lists per channel.
    for channel in Channel::ALL {
        let compressed = module.channel(channel);
        w.line(&format!("{}_refs:", channel.name()));
        w.byte_rows(&ref_record_bytes(&compressed.refs));
        w.line(&format!("{}_residual:", channel.name()));
        w.byte_rows(&res_record_bytes(&compressed.residual));
        w.blank();
    }
}

fn emit_dpcm_tables(w: &mut AsmWriter, dpcm_index: Option<&DpcmIndex>) {
    let slot_count = dpcm_index
        .map(|index| {
            index
                .slots()
                .map(|(slot, _)| usize::from(slot) + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0)
        .max(1);

    // Samples pack upward from $C000 in slot order, 64-byte aligned.
    let mut addr = vec![0u8; slot_count];
    let mut len = vec![0u8; slot_count];
    if let Some(index) = dpcm_index {
        let mut offset = 0u32;
        for (slot, sample) in index.slots() {
            addr[usize::from(slot)] = (offset / 64) as u8;
            len[usize::from(slot)] = sample.length_byte();
            offset += (sample.sample_bytes + 63) / 64 * 64;
        }
    }
    w.line("dpcm_addr_table:");
    w.byte_rows(&addr);
    w.line("dpcm_len_table:");
    w.byte_rows(&len);
    w.blank();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::frame_gen::pulse_control;
    use crate::tracker::pattern::{
        CompressedChannel, PatternLibrary, PatternReference,
    };

    fn cell(note: u8, volume: u8) -> FrameCell {
        FrameCell {
            note: Some(note),
            volume,
            timer: timer_for(Channel::Pulse1, note),
            control: pulse_control(2, volume),
            retrigger: false,
        }
    }

    fn module_with_pattern() -> SongModule {
        let mut library = PatternLibrary::new();
        let id = library.intern(&[cell(60, 8), cell(62, 8), cell(64, 8)]);
        let mut channels: Vec<CompressedChannel> = Channel::ALL
            .iter()
            .map(|&channel| CompressedChannel {
                channel,
                refs: Vec::new(),
                residual: Vec::new(),
            })
            .collect();
        channels[0].refs = vec![
            PatternReference {
                frame: 2,
                pattern_id: id,
                transpose: 0,
                volume_delta: 0,
            },
            PatternReference {
                frame: 9,
                pattern_id: id,
                transpose: 5,
                volume_delta: -2,
            },
        ];
        channels[0].residual = vec![(0, Channel::Pulse1.silent_cell()), (5, cell(50, 4))];
        SongModule {
            library,
            channels,
            total_frames: 12,
            frame_rate: 60,
            loop_frame: None,
        }
    }

    #[test]
    fn test_cell_roundtrip_all_channels() {
        let pulse = cell(60, 8);
        assert_eq!(decode_cell(Channel::Pulse1, encode_cell(&pulse)), pulse);

        let mut triangle = cell(48, 15);
        triangle.timer = timer_for(Channel::Triangle, 48);
        triangle.control = 0xFF;
        triangle.retrigger = true;
        assert_eq!(decode_cell(Channel::Triangle, encode_cell(&triangle)), triangle);

        let noise = FrameCell {
            note: Some(7),
            volume: 9,
            timer: 7,
            control: 0x30 | 9,
            retrigger: true,
        };
        assert_eq!(decode_cell(Channel::Noise, encode_cell(&noise)), noise);

        for channel in Channel::ALL {
            let silent = channel.silent_cell();
            assert_eq!(decode_cell(channel, encode_cell(&silent)), silent);
        }
    }

    #[test]
    fn test_ref_records_use_start_deltas() {
        let refs = vec![
            PatternReference {
                frame: 10,
                pattern_id: 3,
                transpose: 0,
                volume_delta: 0,
            },
            PatternReference {
                frame: 25,
                pattern_id: 4,
                transpose: -2,
                volume_delta: 1,
            },
        ];
        let bytes = ref_record_bytes(&refs);
        assert_eq!(&bytes[..5], &[10, 0, 3, 0, 0]);
        assert_eq!(&bytes[5..10], &[15, 0, 4, 0xFE, 1]);
        assert_eq!(&bytes[10..], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_res_records_and_sentinel() {
        let residual = vec![(4u32, cell(60, 8)), (6u32, Channel::Pulse1.silent_cell())];
        let bytes = res_record_bytes(&residual);
        assert_eq!(bytes.len(), 2 * 5 + 2);
        assert_eq!(&bytes[..2], &[4, 0]);
        assert_eq!(bytes[2], 60);
        assert_eq!(&bytes[5..7], &[2, 0]);
        assert_eq!(bytes[7], 0xFF);
        assert_eq!(&bytes[10..], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_assembly_structure() {
        let module = module_with_pattern();
        let options = EmitOptions {
            mapper: Mapper::Nrom,
            debug_overlay: false,
        };
        let asm = emit_assembly(&module, None, &options).unwrap();
        for needle in [
            ".segment \"HEADER\"",
            ".segment \"ZEROPAGE\"",
            ".segment \"CODE\"",
            ".segment \"RODATA\"",
            ".segment \"VECTORS\"",
            "reset:",
            "nmi:",
            "irq:",
            "init_music:",
            "update_music:",
            "update_pulse1:",
            "update_dpcm:",
            "pattern_0:",
            "song_header:",
            "note_lo:",
            "tri_hi:",
            "pulse1_refs:",
            "dpcm_residual:",
            "    .word nmi",
            "    .word reset",
            "    .word irq",
            "sta $4015",
        ] {
            assert!(asm.contains(needle), "missing {:?}", needle);
        }
        // No overlay unless asked for.
        assert!(!asm.contains("debug_overlay"));
    }

    #[test]
    fn test_debug_overlay_is_additive() {
        let module = module_with_pattern();
        let base = emit_assembly(
            &module,
            None,
            &EmitOptions {
                mapper: Mapper::Nrom,
                debug_overlay: false,
            },
        )
        .unwrap();
        let overlaid = emit_assembly(
            &module,
            None,
            &EmitOptions {
                mapper: Mapper::Nrom,
                debug_overlay: true,
            },
        )
        .unwrap();
        assert!(overlaid.contains("debug_overlay:"));
        assert!(overlaid.contains("put_hex_byte:"));
        // The overlay adds code but never touches APU registers.
        assert!(overlaid.len() > base.len());
        let overlay_block: String = overlaid
            .lines()
            .skip_while(|l| !l.starts_with("debug_overlay:"))
            .take_while(|l| !l.starts_with("note_lo"))
            .collect();
        assert!(!overlay_block.contains("$40"));
    }

    #[test]
    fn test_mmc1_emits_bank_init() {
        let module = module_with_pattern();
        let asm = emit_assembly(
            &module,
            None,
            &EmitOptions {
                mapper: Mapper::Mmc1,
                debug_overlay: false,
            },
        )
        .unwrap();
        assert!(asm.contains("mmc1_write_control"));
        assert!(asm.contains("lda #$0C"));
    }

    #[test]
    fn test_too_long_song_rejected() {
        let mut module = module_with_pattern();
        module.total_frames = MAX_FRAMES + 1;
        let result = emit_assembly(
            &module,
            None,
            &EmitOptions {
                mapper: Mapper::Nrom,
                debug_overlay: false,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_data_size_accounts_for_everything() {
        let module = module_with_pattern();
        let size = data_size(&module, None);
        // 3 pattern cells, 2 refs, 2 residual entries plus the fixed
        // tables.
        assert!(size > 512);
        assert!(size < 1200);
    }
}
