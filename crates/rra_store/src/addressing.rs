//! Pure addressing arithmetic: mapping `(series, time)` to `(bundle, segment,
//! index, slot)` and back, with no I/O and no knowledge of the catalog.
//!
//! Everything here is deterministic and total over its documented domain, so
//! it is exercised with `proptest` rather than example-based tests.

/// Lap counters saturate at one below the signed 16-bit max, matching the
/// `SMALLINT`/`i16` column used to store them.
pub const VERSION_MODULUS: i64 = 32767;

/// Segment containing bundle position `pos`, given the bundle's `width`.
pub fn segment_of(pos: i64, width: i32) -> i32 {
    (pos / width as i64) as i32
}

/// An archive's offset within its segment's `width`-wide arrays.
pub fn index_of(pos: i64, width: i32) -> i32 {
    (pos % width as i64) as i32
}

/// The ring-buffer slot holding timestamp `t_ms` for an archive stepping at
/// `step_ms` with `size` slots per lap.
pub fn slot_index(t_ms: i64, step_ms: i64, size: i32) -> i32 {
    ((t_ms / step_ms).rem_euclid(size as i64)) as i32
}

/// The lap counter for timestamp `t_ms`: how many times the ring has wrapped
/// since the epoch.
///
/// Computed in `i64` throughout and only narrowed to the storage width at the
/// very end, so the modulo never wraps mid-computation regardless of how far
/// `t_ms` is from the epoch.
pub fn lap_version(t_ms: i64, step_ms: i64, size: i32) -> i32 {
    let lap_len = step_ms * size as i64;
    (t_ms.div_euclid(lap_len)).rem_euclid(VERSION_MODULUS) as i32
}

/// The expected version of slot `i`, given the archive's current `latest_ms`.
///
/// Slots past `latest_i` in ring order were last written on the previous lap;
/// slots at or before it were (or should have been) written this lap.
pub fn expected_version(latest_ms: i64, step_ms: i64, size: i32, i: i32) -> i32 {
    let latest_i = slot_index(latest_ms, step_ms, size);
    let latest_ver = lap_version(latest_ms, step_ms, size);
    if i > latest_i {
        (latest_ver - 1).rem_euclid(VERSION_MODULUS as i32)
    } else {
        latest_ver
    }
}

/// The wall-clock timestamp slot `i` represents, given the archive's current
/// `latest_ms`. Always `<= latest_ms`; wraps around the ring so that the slot
/// immediately after `latest_i` is the oldest retained sample.
pub fn slot_timestamp(latest_ms: i64, step_ms: i64, size: i32, i: i32) -> i64 {
    let latest_i = slot_index(latest_ms, step_ms, size);
    let size = size as i64;
    let back = (size + latest_i as i64 - i as i64).rem_euclid(size);
    latest_ms - step_ms * back
}

/// Whether a slot's stored version agrees with what `latest_ms` implies it
/// should be. A `None` stored version (column NULL / not yet backfilled) is
/// always treated as a match, per the bootstrap convenience in the spec.
pub fn is_live(latest_ms: i64, step_ms: i64, size: i32, i: i32, stored_ver: Option<i32>) -> bool {
    match stored_ver {
        None => true,
        Some(v) => v == expected_version(latest_ms, step_ms, size, i),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn step_and_size() -> impl Strategy<Value = (i64, i32)> {
        (1i64..=60_000, 2i32..=2000)
    }

    proptest! {
        /// Addressing round-trip (Section 8, invariant 1): the slot holding
        /// `latest_ms` maps back to `latest_ms` itself, and walking `k` slots
        /// back from it subtracts exactly `k * step_ms`.
        #[test]
        fn addressing_round_trip(
            (step_ms, size) in step_and_size(),
            t in 0i64..=1_000_000_000_000,
        ) {
            let latest_ms = (t / step_ms) * step_ms;
            let latest_i = slot_index(latest_ms, step_ms, size);
            prop_assert_eq!(slot_timestamp(latest_ms, step_ms, size, latest_i), latest_ms);

            for k in 0..size {
                let i = (((latest_i as i64 - k as i64).rem_euclid(size as i64))) as i32;
                prop_assert_eq!(
                    slot_timestamp(latest_ms, step_ms, size, i),
                    latest_ms - step_ms * k as i64,
                );
            }
        }

        /// Lap boundary (invariant 3): advancing `latest` by exactly one full
        /// lap (`step_ms * size`) without touching any slot increments every
        /// slot's expected version by one, so a version stamped before the
        /// advance is now stale everywhere.
        #[test]
        fn lap_boundary_invalidates_every_slot(
            (step_ms, size) in step_and_size(),
            t in 0i64..=1_000_000_000_000,
        ) {
            let latest_ms = (t / step_ms) * step_ms;
            let advanced = latest_ms + step_ms * size as i64;

            for i in 0..size {
                let before = expected_version(latest_ms, step_ms, size, i);
                let after = expected_version(advanced, step_ms, size, i);
                let expected_after = (before + 1).rem_euclid(VERSION_MODULUS as i32);
                prop_assert_eq!(after, expected_after);
                prop_assert!(!is_live(advanced, step_ms, size, i, Some(before)));
            }
        }

        /// `None` stored versions never read as stale, regardless of how far
        /// `latest_ms` has advanced.
        #[test]
        fn missing_version_column_is_always_live(
            (step_ms, size) in step_and_size(),
            t in 0i64..=1_000_000_000_000,
            i in 0i32..2000,
        ) {
            let i = i % size;
            prop_assert!(is_live(t, step_ms, size, i, None));
        }

        /// `segment_of`/`index_of` partition `pos` exactly: reconstructing
        /// `pos` from its segment and index always round-trips.
        #[test]
        fn segment_index_round_trip(pos in 0i64..10_000_000, width in 1i32..4000) {
            let seg = segment_of(pos, width);
            let idx = index_of(pos, width);
            prop_assert_eq!(seg as i64 * width as i64 + idx as i64, pos);
            prop_assert!(idx < width);
        }
    }

    #[test]
    fn s1_single_ds_single_archive_first_write() {
        // Step 1000ms, size 10. Writes at t=10000 (slot 0) and t=11000 (slot 1).
        let step_ms = 1000;
        let size = 10;
        let latest_ms = 11000;
        assert_eq!(slot_index(10000, step_ms, size), 0);
        assert_eq!(slot_index(11000, step_ms, size), 1);
        // 11000 / (1000*10) = 1 lap elapsed.
        assert_eq!(lap_version(latest_ms, step_ms, size), 1);
        assert_eq!(expected_version(latest_ms, step_ms, size, 1), 1);
        assert_eq!(expected_version(latest_ms, step_ms, size, 0), 1);
        // Slot 2 (not yet written this lap) was last written the previous lap.
        assert_eq!(expected_version(latest_ms, step_ms, size, 2), 0);
        assert_eq!(slot_timestamp(latest_ms, step_ms, size, 1), 11000);
        assert_eq!(slot_timestamp(latest_ms, step_ms, size, 0), 10000);
    }
}
