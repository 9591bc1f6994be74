use velf_reloc::codec::{self, EntryType, RelocWriter, decode_stream};
use velf_reloc::convert::{self, Config, ConvertFlags, convert_segment};
use velf_reloc::index::{Relocation, RelocationIndex};
use velf_reloc::segment::{Segment, SegmentSet};
use velf_reloc::{Error, RelocKind};

fn reloc(
    target_segment: u8,
    target_offset: u32,
    symbol_segment: u8,
    symbol_offset: u32,
    kind: RelocKind,
) -> Relocation {
    Relocation {
        target_segment,
        target_offset,
        symbol_segment,
        symbol_offset,
        kind,
    }
}

fn config(flags: ConvertFlags) -> Config {
    Config { flags, align: 4 }
}

fn index_of(target_segment: u8, relocs: &[Relocation]) -> RelocationIndex {
    let mut index = RelocationIndex::new(target_segment);
    for r in relocs {
        index.insert(*r);
    }
    index
}

/// The entry-type nibble of every record in a stream, in order.
fn entry_types(stream: &[u8]) -> Vec<u8> {
    let mut types = Vec::new();
    let mut pos = 0;
    while pos < stream.len() {
        let ty = EntryType::from_nibble(stream[pos] & 0xF).expect("valid entry type");
        types.push(ty as u8);
        pos += ty.size();
    }
    types
}

fn decode_plain(stream: &[u8], cfg: &Config) -> Vec<Relocation> {
    decode_stream(stream, cfg)
        .expect("stream decodes")
        .into_iter()
        .map(|e| e.reloc)
        .collect()
}

fn sorted(mut relocs: Vec<Relocation>) -> Vec<Relocation> {
    relocs.sort_by_key(|r| {
        (
            r.target_offset,
            r.kind.code(),
            r.symbol_segment,
            r.symbol_offset,
        )
    });
    relocs
}

#[test]
fn empty_inputs_are_idempotent() {
    let cfg = Config::default();
    assert!(decode_stream(&[], &cfg).unwrap().is_empty());

    let mut index = RelocationIndex::new(0);
    let bytes = codec::encode(&mut index, &cfg).unwrap();
    assert!(bytes.is_empty());
    convert::verify(&bytes, 0, &cfg).unwrap();
}

#[test]
fn round_trip_preserves_mixed_kinds() {
    let input = vec![
        reloc(0, 0x0000_0100, 1, 0x40, RelocKind::Abs32),
        reloc(0, 0x0001_0000, 1, 0x40, RelocKind::Rel32),
        reloc(0, 0x0100_0000, 2, 0x0050_0000, RelocKind::ThmCall),
        reloc(0, 0x0000_2000, 0, 0x1000, RelocKind::Prel31),
        reloc(0, 0x0000_3000, 3, 0x44, RelocKind::Target2),
    ];
    let mut index = index_of(0, &input);
    let checksum = index.checksum();

    let cfg = config(ConvertFlags::empty());
    let bytes = codec::encode(&mut index, &cfg).unwrap();
    let decoded = decode_plain(&bytes, &cfg);

    assert_eq!(sorted(decoded), sorted(input));
    convert::verify(&bytes, checksum, &cfg).unwrap();
}

#[test]
fn segment_filter_drops_foreign_targets() {
    let mut index = RelocationIndex::new(0);
    index.insert(reloc(1, 0x100, 0, 0, RelocKind::Abs32));
    assert!(index.is_empty());
    assert_eq!(index.registered(), 1);
}

#[test]
fn none_and_v4bx_never_enter_the_index() {
    let mut index = RelocationIndex::new(0);
    index.insert(reloc(0, 0x100, 0, 0, RelocKind::None));
    index.insert(reloc(0, 0x104, 0, 0, RelocKind::V4bx));
    assert!(index.is_empty());
    assert_eq!(index.registered(), 2);
}

#[test]
fn close_pair_always_packs_into_one_long_record() {
    let input = [
        reloc(0, 0x100, 1, 0x40, RelocKind::Rel32),
        reloc(0, 0x110, 1, 0x40, RelocKind::Rel32),
    ];
    let cfg = config(ConvertFlags::empty());
    // Both relocations are eligible for a delta record on their own; the
    // pairing must win, and identically on every run.
    let first = codec::encode(&mut index_of(0, &input), &cfg).unwrap();
    let second = codec::encode(&mut index_of(0, &input), &cfg).unwrap();
    assert_eq!(first, second);
    assert_eq!(entry_types(&first), [0]);
    assert_eq!(sorted(decode_plain(&first, &cfg)), sorted(input.to_vec()));
}

#[test]
fn wide_symbol_offset_is_never_a_short_entry() {
    let cfg = config(ConvertFlags::empty());

    let far = [reloc(0, 0x3_0000, 1, 1 << 22, RelocKind::Rel32)];
    let bytes = codec::encode(&mut index_of(0, &far), &cfg).unwrap();
    assert_eq!(entry_types(&bytes), [0]);

    let near = [reloc(0, 0x3_0000, 1, (1 << 22) - 1, RelocKind::Rel32)];
    let bytes = codec::encode(&mut index_of(0, &near), &cfg).unwrap();
    assert_eq!(entry_types(&bytes), [1]);

    assert_eq!(sorted(decode_plain(&bytes, &cfg)), sorted(near.to_vec()));
}

#[test]
fn forward_deltas_use_delta_records() {
    let input = [
        reloc(0, 0x100, 1, 0x40, RelocKind::Rel32),
        reloc(0, 0x140, 2, 0x80, RelocKind::Prel31),
    ];
    let cfg = config(ConvertFlags::empty());
    let bytes = codec::encode(&mut index_of(0, &input), &cfg).unwrap();
    assert_eq!(entry_types(&bytes), [2, 2]);
    assert_eq!(sorted(decode_plain(&bytes, &cfg)), sorted(input.to_vec()));
}

#[test]
fn mov_pairs_pack_into_pair_records() {
    let sym = (2u8, 0x8000u32);
    let mut input = Vec::new();
    for base in [0x100u32, 0x200, 0x300] {
        input.push(reloc(0, base, sym.0, sym.1, RelocKind::MovwAbsNc));
        input.push(reloc(0, base + 4, sym.0, sym.1, RelocKind::MovtAbs));
    }
    let cfg = config(ConvertFlags::empty());
    let bytes = codec::encode(&mut index_of(0, &input), &cfg).unwrap();
    // First pair establishes the symbol, the remaining two pairs share one
    // packed record.
    assert_eq!(entry_types(&bytes), [3, 5]);
    assert_eq!(sorted(decode_plain(&bytes, &cfg)), sorted(input));
}

#[test]
fn thumb_mov_pairs_round_trip_the_thumb_kinds() {
    let input = vec![
        reloc(0, 0x50, 1, 0x1000, RelocKind::ThmMovwAbsNc),
        reloc(0, 0x54, 1, 0x1000, RelocKind::ThmMovtAbs),
        reloc(0, 0x90, 1, 0x1000, RelocKind::ThmMovwAbsNc),
        reloc(0, 0x94, 1, 0x1000, RelocKind::ThmMovtAbs),
    ];
    let cfg = config(ConvertFlags::empty());
    let bytes = codec::encode(&mut index_of(0, &input), &cfg).unwrap();
    assert_eq!(entry_types(&bytes), [3, 4]);
    let decoded = decode_plain(&bytes, &cfg);
    assert_eq!(sorted(decoded), sorted(input));
}

#[test]
fn pointer_run_from_running_offset_packs_one_record() {
    let sym = (1u8, 0x50u32);
    let input: Vec<_> = (0..5)
        .map(|i| reloc(0, i * 4, sym.0, sym.1, RelocKind::Abs32))
        .collect();
    let cfg = config(ConvertFlags::BATCH_POINTERS | ConvertFlags::SORT_BATCH);
    let bytes = codec::encode(&mut index_of(0, &input), &cfg).unwrap();

    // All five fixups ride a single 2-bit-slot record.
    assert_eq!(entry_types(&bytes), [9]);
    // The lead slot is zero; the four followers are one word each.
    let packed = (1u32 << 2) | (1 << 4) | (1 << 6) | (1 << 8);
    let expected = (EntryType::FixupRun14 as u32) | (packed << 4);
    assert_eq!(bytes, expected.to_le_bytes());

    let decoded = decode_stream(&bytes, &cfg).unwrap();
    assert!(decoded.iter().all(|e| e.pointer));
    let offsets: Vec<_> = decoded.iter().map(|e| e.reloc.target_offset).collect();
    assert_eq!(offsets, [0, 4, 8, 12, 16]);
    assert!(decoded.iter().all(|e| e.reloc.kind == RelocKind::Abs32));
}

#[test]
fn far_pointer_run_splits_on_the_lead_delta() {
    let sym = (1u8, 0x50u32);
    let input: Vec<_> = [0x100u32, 0x104, 0x108, 0x10C, 0x110]
        .iter()
        .map(|&off| reloc(0, off, sym.0, sym.1, RelocKind::Abs32))
        .collect();
    let cfg = config(ConvertFlags::BATCH_POINTERS | ConvertFlags::SORT_BATCH);
    let bytes = codec::encode(&mut index_of(0, &input), &cfg).unwrap();

    // The 64-word lead delta needs 7-bit slots; the followers continue in
    // exactly one 2-bit-slot record.
    assert_eq!(entry_types(&bytes), [7, 9]);
    let offsets: Vec<_> = decode_plain(&bytes, &cfg)
        .iter()
        .map(|r| r.target_offset)
        .collect();
    assert_eq!(offsets, [0x100, 0x104, 0x108, 0x10C, 0x110]);
}

#[test]
fn scattered_pointers_fall_back_to_wide_fixups() {
    let sym = (1u8, 0x50u32);
    let input = [
        reloc(0, 0x10_0000, sym.0, sym.1, RelocKind::Abs32),
        reloc(0, 0x20_0000, sym.0, sym.1, RelocKind::Abs32),
        // Unaligned site: not expressible as a word delta at all.
        reloc(0, 0x20_0002, sym.0, sym.1, RelocKind::Abs32),
    ];
    let cfg = config(ConvertFlags::BATCH_POINTERS | ConvertFlags::SORT_BATCH);
    let bytes = codec::encode(&mut index_of(0, &input), &cfg).unwrap();
    assert_eq!(entry_types(&bytes), [6, 6, 1]);
    let decoded = decode_plain(&bytes, &cfg);
    let offsets: Vec<_> = decoded.iter().map(|r| r.target_offset).collect();
    assert_eq!(offsets, [0x10_0000, 0x20_0000, 0x20_0002]);
}

#[test]
fn target1_batches_as_abs32() {
    let input = [reloc(0, 0x8, 2, 0x10, RelocKind::Target1)];
    let cfg = config(ConvertFlags::BATCH_POINTERS);
    let bytes = codec::encode(&mut index_of(0, &input), &cfg).unwrap();
    assert_eq!(entry_types(&bytes), [9]);
    let decoded = decode_plain(&bytes, &cfg);
    assert_eq!(decoded[0].kind, RelocKind::Abs32);
    assert_eq!(decoded[0].target_offset, 0x8);
}

#[test]
fn partition_keeps_segment_one_symbols_last() {
    let mut index = index_of(
        0,
        &[
            reloc(0, 0x10, 1, 0x0, RelocKind::Abs32),
            reloc(0, 0x20, 2, 0x0, RelocKind::Abs32),
            reloc(0, 0x30, 1, 0x4, RelocKind::Abs32),
            reloc(0, 0x40, 2, 0x4, RelocKind::Rel32),
        ],
    );
    let batch = index.partition_pointer_class(RelocKind::Abs32);
    let symbol_segments: Vec<_> = batch.iter().map(|r| r.symbol_segment).collect();
    assert_eq!(symbol_segments, [2, 1, 1]);
    // The non-pointer relocation stays behind.
    assert_eq!(index.len(), 1);
}

#[test]
fn pointer_fixups_resolve_and_rebase() {
    // Segment 1 is rebased by +0x1000_0000; segment 0 stays put.
    let mut seg0 = vec![0u8; 0x20];
    seg0[0..4].copy_from_slice(&0x8110_0008u32.to_le_bytes());
    seg0[4..8].copy_from_slice(&0x8100_0010u32.to_le_bytes());
    let mut segments = SegmentSet::new(vec![
        Segment::new(0, 0x8100_0000, seg0),
        Segment::with_vaddr(1, 0x8110_0000, 0x9110_0000, vec![0u8; 0x20]),
    ]);

    let mut writer = RelocWriter::new();
    writer
        .fixup_run(EntryType::FixupRun14, &[0, 1])
        .unwrap();
    let input = writer.into_bytes();

    let cfg = config(
        ConvertFlags::BATCH_POINTERS | ConvertFlags::SORT_BATCH | ConvertFlags::VERIFY,
    );
    let out = convert_segment(&input, 0, &mut segments, &cfg).unwrap();

    // Site 0 pointed into the rebased segment 1 and moved with it; site 4
    // pointed into segment 0 and is unchanged.
    let seg0 = segments.get(0).unwrap();
    assert_eq!(seg0.read_u32(0).unwrap(), 0x9110_0008);
    assert_eq!(seg0.read_u32(4).unwrap(), 0x8100_0010);

    // Both fixups re-encode as one packed record, checksum intact.
    assert_eq!(entry_types(&out.data), [9]);
    assert_eq!(out.checksum, 4);
}

#[test]
fn pre_relocate_patches_before_encoding() {
    let mut writer = RelocWriter::new();
    // One ABS32 data word at offset 0, symbol at segment 1 + 0x10.
    writer
        .long_entry(1, RelocKind::Abs32.code(), 0, 0, 0, 0x10, 0)
        .unwrap();
    let input = writer.into_bytes();

    let mut segments = SegmentSet::new(vec![
        Segment::new(0, 0x8000, vec![0u8; 8]),
        Segment::new(1, 0x9000, vec![0u8; 0x20]),
    ]);
    let cfg = config(ConvertFlags::PRE_RELOCATE | ConvertFlags::VERIFY);
    convert_segment(&input, 0, &mut segments, &cfg).unwrap();
    assert_eq!(segments.get(0).unwrap().read_u32(0).unwrap(), 0x9010);
}

#[test]
fn apply_patches_every_indexed_relocation() {
    let mut seg0 = vec![0u8; 8];
    seg0[4..8].copy_from_slice(&0xE300_C000u32.to_le_bytes());
    let mut segments = SegmentSet::new(vec![
        Segment::new(0, 0x8000, seg0),
        Segment::new(1, 0x9000, vec![0u8; 0x20]),
    ]);
    let index = index_of(
        0,
        &[
            reloc(0, 0, 1, 0x10, RelocKind::Abs32),
            reloc(0, 4, 1, 0x10, RelocKind::MovwAbsNc),
        ],
    );
    convert::apply(&index, &mut segments).unwrap();
    let seg0 = segments.get(0).unwrap();
    assert_eq!(seg0.read_u32(0).unwrap(), 0x9010);
    assert_eq!(seg0.read_u32(4).unwrap(), 0xE309_C010);
}

#[test]
fn unknown_entry_type_is_rejected() {
    let cfg = Config::default();
    let err = decode_stream(&[0x0A, 0, 0, 0], &cfg).unwrap_err();
    assert!(matches!(err, Error::Malformed { .. }));
}

#[test]
fn truncated_record_is_rejected() {
    let cfg = Config::default();
    // A type-0 record claims 12 bytes; only 4 are present.
    let err = decode_stream(&[0x00, 0, 0, 0], &cfg).unwrap_err();
    assert!(matches!(err, Error::Malformed { .. }));
}

#[test]
fn pair_reuse_without_state_is_rejected() {
    let mut writer = RelocWriter::new();
    writer.mov_pair(0x10, 4).unwrap();
    let cfg = Config::default();
    let err = decode_stream(&writer.into_bytes(), &cfg).unwrap_err();
    assert!(matches!(err, Error::Malformed { .. }));
}

#[test]
fn unresolvable_pointer_is_rejected() {
    let mut writer = RelocWriter::new();
    writer.fixup(1).unwrap();
    let input = writer.into_bytes();
    // The site exists but holds a value outside every loaded segment.
    let mut segments = SegmentSet::new(vec![Segment::new(0, 0x1000, vec![0u8; 8])]);
    let cfg = Config::default();
    let err = convert_segment(&input, 0, &mut segments, &cfg).unwrap_err();
    assert!(matches!(err, Error::Malformed { .. }));
}

#[test]
fn fixup_site_outside_segment_is_rejected() {
    let mut writer = RelocWriter::new();
    writer.fixup(0x100).unwrap();
    let input = writer.into_bytes();
    let mut segments = SegmentSet::new(vec![Segment::new(0, 0x1000, vec![0u8; 8])]);
    let cfg = Config::default();
    let err = convert_segment(&input, 0, &mut segments, &cfg).unwrap_err();
    assert!(matches!(err, Error::Malformed { .. }));
}

#[test]
fn checksum_mismatch_is_fatal() {
    let input = [reloc(0, 0x100, 1, 0x40, RelocKind::Rel32)];
    let cfg = config(ConvertFlags::empty());
    let mut index = index_of(0, &input);
    let checksum = index.checksum();
    let bytes = codec::encode(&mut index, &cfg).unwrap();
    let err = convert::verify(&bytes, checksum.wrapping_add(1), &cfg).unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }));
}

#[test]
fn writer_rejects_wide_fields_without_writing() {
    let mut writer = RelocWriter::new();
    assert!(writer.fixup(1 << 28).is_err());
    assert!(writer.short_entry(0, 2, 0, 1 << 22, 0).is_err());
    assert!(writer.short_entry(0, 2, 0, 0, 1 << 22).is_err());
    assert!(writer.delta_entry(0, 2, 1 << 16, 0).is_err());
    assert!(writer.mov_pair(1 << 23, 0).is_err());
    assert!(writer.mov_pair(0, 1 << 5).is_err());
    assert!(writer.mov_pair_x2(1 << 9, 0, 0, 0).is_err());
    assert!(writer.long_entry(16, 2, 0, 0, 0, 0, 0).is_err());
    assert!(
        writer
            .fixup_run(EntryType::FixupRun14, &[1; 15])
            .is_err()
    );
    assert!(writer.fixup_run(EntryType::FixupRun14, &[4]).is_err());
    assert_eq!(writer.len(), 0);
}

#[test]
fn checksum_counts_mov_family_symbols() {
    let plain = index_of(0, &[reloc(0, 0x10, 1, 0x40, RelocKind::Rel32)]);
    assert_eq!(plain.checksum(), 0x10);

    let mov = index_of(0, &[reloc(0, 0x10, 1, 0x40, RelocKind::MovwAbsNc)]);
    assert_eq!(mov.checksum(), 0x10 + 0x40 + 1);
}
