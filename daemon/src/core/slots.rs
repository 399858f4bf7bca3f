use atoll_common::time::TimestampSeconds;

// Pure slot clock: timestamp <-> slot number <-> forger index.
// Slot 0 opens at the genesis timestamp; every slot is `block_time`
// seconds wide and exactly one delegate is allowed to forge in it.
#[derive(Debug, Clone, Copy)]
pub struct Slots {
    genesis_timestamp: TimestampSeconds,
    block_time: TimestampSeconds,
    round_length: u64,
}

impl Slots {
    pub fn new(
        genesis_timestamp: TimestampSeconds,
        block_time: TimestampSeconds,
        round_length: u64,
    ) -> Self {
        assert!(block_time > 0, "block time must be positive");
        assert!(round_length > 0, "round length must be positive");
        Self {
            genesis_timestamp,
            block_time,
            round_length,
        }
    }

    pub fn get_block_time(&self) -> TimestampSeconds {
        self.block_time
    }

    pub fn get_round_length(&self) -> u64 {
        self.round_length
    }

    // Timestamps before genesis map to slot 0
    pub fn slot_for_timestamp(&self, timestamp: TimestampSeconds) -> u64 {
        timestamp.saturating_sub(self.genesis_timestamp) / self.block_time
    }

    pub fn slot_start(&self, slot: u64) -> TimestampSeconds {
        self.genesis_timestamp + slot * self.block_time
    }

    pub fn is_within_slot(&self, slot: u64, timestamp: TimestampSeconds) -> bool {
        self.slot_for_timestamp(timestamp) == slot
    }

    // Index into the active validator set assigned to this slot
    pub fn forger_index(&self, slot: u64) -> usize {
        (slot % self.round_length) as usize
    }

    // Rounds are 1-based over block heights: heights 1..=round_length are
    // round 1. The genesis block sits in round 0.
    pub fn round_for_height(&self, height: u64) -> u64 {
        if height == 0 {
            return 0;
        }
        (height - 1) / self.round_length + 1
    }

    // True when `height` is the last block of its round
    pub fn is_round_end(&self, height: u64) -> bool {
        height > 0 && height % self.round_length == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots() -> Slots {
        Slots::new(1_000, 10, 5)
    }

    #[test]
    fn test_slot_boundaries() {
        let slots = slots();
        assert_eq!(slots.slot_for_timestamp(1_000), 0);
        assert_eq!(slots.slot_for_timestamp(1_009), 0);
        assert_eq!(slots.slot_for_timestamp(1_010), 1);
        assert_eq!(slots.slot_start(3), 1_030);
        assert!(slots.is_within_slot(3, 1_035));
        assert!(!slots.is_within_slot(3, 1_040));
    }

    #[test]
    fn test_timestamp_before_genesis_clamps() {
        assert_eq!(slots().slot_for_timestamp(0), 0);
    }

    #[test]
    fn test_forger_index_rotates() {
        let slots = slots();
        assert_eq!(slots.forger_index(0), 0);
        assert_eq!(slots.forger_index(4), 4);
        assert_eq!(slots.forger_index(5), 0);
        assert_eq!(slots.forger_index(12), 2);
    }

    #[test]
    fn test_rounds() {
        let slots = slots();
        assert_eq!(slots.round_for_height(0), 0);
        assert_eq!(slots.round_for_height(1), 1);
        assert_eq!(slots.round_for_height(5), 1);
        assert_eq!(slots.round_for_height(6), 2);
        assert!(slots.is_round_end(5));
        assert!(!slots.is_round_end(6));
        assert!(!slots.is_round_end(0));
    }
}
