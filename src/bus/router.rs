//! Longest-prefix routing over learned destinations

use crate::knx::GroupAddr;

/// Number of leading address bits that identify the main group
pub const MAIN_GROUP_BITS: u8 = 5;

/// Pick the link that should carry a telegram to `destination`
///
/// `observed` yields each link's learned destinations in configuration
/// order. Masks are tried from exact (`0xFFFF`) down to `min_prefix_bits`
/// leading bits; within one mask width the first link holding a matching
/// address wins.
pub fn route<'a, I>(observed: I, destination: GroupAddr, min_prefix_bits: u8) -> Option<usize>
where
    I: Iterator<Item = &'a [GroupAddr]> + Clone,
{
    let max_width = 16 - min_prefix_bits.min(16) as u32;
    (0..=max_width).find_map(|width| {
        let mask = (0xFFFFu32 << width) as u16;
        let target = destination & mask;
        observed
            .clone()
            .position(|addrs| addrs.iter().any(|a| *a & mask == target))
    })
}
