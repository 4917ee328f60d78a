use core::mem::{align_of, size_of};
use memoffset::offset_of;
use cdp_prog::constants::{CONFIG_LEN, ENGINE_ALIGN, ENGINE_LEN, ENGINE_OFF, HEADER_LEN, SLAB_LEN};
use cdp_prog::engine::{CdpEngine, Position, MAX_POSITIONS};
use cdp_prog::layout::{position_field_offsets, position_offset, POSITION_LEN};
use cdp_prog::state::{SlabHeader, SystemConfig};

#[test]
fn test_struct_sizes() {
    assert_eq!(size_of::<SlabHeader>(), HEADER_LEN);
    assert_eq!(size_of::<SystemConfig>(), 176);
    assert_eq!(CONFIG_LEN, 176);
    assert_eq!(size_of::<Position>(), 208);
    assert_eq!(POSITION_LEN, 208);
    assert_eq!(ENGINE_ALIGN, align_of::<CdpEngine>());
    assert_eq!(ENGINE_OFF % ENGINE_ALIGN, 0);
    assert!(ENGINE_OFF >= HEADER_LEN + CONFIG_LEN);
    assert_eq!(SLAB_LEN, ENGINE_OFF + ENGINE_LEN);
}

#[test]
fn position_fields_keep_their_order() {
    let offsets = position_field_offsets();
    let names: Vec<&str> = offsets.iter().map(|(name, _)| *name).collect();
    assert_eq!(
        names,
        vec![
            "debt", "coll_shares", "stake", "status", "debt_snapshot", "coll_snapshot",
            "fee_snapshot", "nicr", "liquidator_reward_shares", "surplus_shares",
            "position_id", "owner", "prev", "next",
        ]
    );
    for pair in offsets.windows(2) {
        assert!(pair[0].1 < pair[1].1, "{} is not before {}", pair[0].0, pair[1].0);
    }

    // Pinned for external readers
    assert_eq!(offsets[0].1, 0);
    assert_eq!(offsets[1].1, 16);
    assert_eq!(offsets[2].1, 32);
    assert_eq!(offsets[3].1, 48);
    assert_eq!(offsets[4].1, 64);
    assert_eq!(offsets[11].1, 168);
    assert_eq!(offsets[13].1, 202);
}

#[test]
fn position_offsets_index_the_slab() {
    let base = ENGINE_OFF + offset_of!(CdpEngine, positions);
    assert_eq!(position_offset(0), base);
    assert_eq!(position_offset(1), base + POSITION_LEN);

    let last = position_offset((MAX_POSITIONS - 1) as u16);
    assert!(last + POSITION_LEN <= SLAB_LEN);
}

#[test]
fn position_bytes_read_back_from_offsets() {
    let mut engine = CdpEngine::new_boxed(Default::default(), 0);
    engine.positions[3].debt = 0xdead_beef;
    engine.positions[3].owner = [7u8; 32];

    let bytes = bytemuck::bytes_of(&engine.positions[3]);
    let offsets = position_field_offsets();
    assert_eq!(u128::from_le_bytes(bytes[offsets[0].1..offsets[0].1 + 16].try_into().unwrap()), 0xdead_beef);
    assert_eq!(&bytes[offsets[11].1..offsets[11].1 + 32], &[7u8; 32]);
}
