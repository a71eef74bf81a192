//! Per-channel controller state over time.

use std::collections::BTreeMap;

pub const CHANNEL_COUNT: usize = 16;

/// A value that takes effect at a tick and stays in effect until the next
/// change on the same channel.
///
/// Lookups before the first change on a channel return the default.
#[derive(Debug, Clone)]
pub struct ChannelStateMap<V> {
    channels: [BTreeMap<u64, V>; CHANNEL_COUNT],
    default: V,
}

impl<V: Copy> ChannelStateMap<V> {
    pub fn new(default: V) -> Self {
        ChannelStateMap {
            channels: std::array::from_fn(|_| BTreeMap::new()),
            default,
        }
    }

    /// Record a change. A second change at the same tick replaces the first.
    pub fn insert(&mut self, channel: u8, tick: u64, value: V) {
        assert!(
            (channel as usize) < CHANNEL_COUNT,
            "channel {channel} out of range"
        );
        self.channels[channel as usize].insert(tick, value);
    }

    /// Value in effect on `channel` at `tick`.
    pub fn get(&self, channel: u8, tick: u64) -> V {
        assert!(
            (channel as usize) < CHANNEL_COUNT,
            "channel {channel} out of range"
        );
        self.channels[channel as usize]
            .range(..=tick)
            .next_back()
            .map(|(_, v)| *v)
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_lookup_with_default() {
        let mut map = ChannelStateMap::new(100u8);
        map.insert(3, 480, 64);
        map.insert(3, 960, 32);

        assert_eq!(map.get(3, 0), 100);
        assert_eq!(map.get(3, 479), 100);
        assert_eq!(map.get(3, 480), 64);
        assert_eq!(map.get(3, 959), 64);
        assert_eq!(map.get(3, 10_000), 32);
        // Other channels are independent
        assert_eq!(map.get(4, 10_000), 100);
    }

    #[test]
    fn same_tick_overwrites() {
        let mut map = ChannelStateMap::new(0u8);
        map.insert(0, 10, 1);
        map.insert(0, 10, 2);
        assert_eq!(map.get(0, 10), 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn channel_out_of_range_panics() {
        let map = ChannelStateMap::new(0u8);
        map.get(16, 0);
    }
}
