use proptest::prelude::*;

use crate::coordinator::quality_from_offset;

#[test]
fn test_quality_is_one_at_zero_offset() {
    let (synchronized, quality) = quality_from_offset(0.0, 50.0);
    assert!(synchronized);
    assert_eq!(quality, 1.0);
}

#[test]
fn test_quality_is_zero_at_tolerance_bound() {
    let (synchronized, quality) = quality_from_offset(50.0, 50.0);
    assert!(synchronized);
    assert_eq!(quality, 0.0);

    let (synchronized, quality) = quality_from_offset(-50.0, 50.0);
    assert!(synchronized);
    assert_eq!(quality, 0.0);
}

#[test]
fn test_quality_is_linear_within_tolerance() {
    let (synchronized, quality) = quality_from_offset(20.0, 50.0);
    assert!(synchronized);
    assert!((quality - 0.6).abs() < 1e-9);

    let (synchronized, quality) = quality_from_offset(-25.0, 50.0);
    assert!(synchronized);
    assert!((quality - 0.5).abs() < 1e-9);
}

#[test]
fn test_beyond_tolerance_is_unsynchronized() {
    let (synchronized, quality) = quality_from_offset(50.1, 50.0);
    assert!(!synchronized);
    assert_eq!(quality, 0.0);

    let (synchronized, quality) = quality_from_offset(-1000.0, 50.0);
    assert!(!synchronized);
    assert_eq!(quality, 0.0);
}

proptest! {
    #[test]
    fn quality_stays_in_unit_interval(
        offset_ms in -500.0..500.0f64,
        tolerance_ms in 1.0..200.0f64,
    ) {
        let (synchronized, quality) = quality_from_offset(offset_ms, tolerance_ms);

        prop_assert!((0.0..=1.0).contains(&quality));
        prop_assert_eq!(synchronized, offset_ms.abs() <= tolerance_ms);
        if !synchronized {
            prop_assert_eq!(quality, 0.0);
        }
    }

    #[test]
    fn quality_is_symmetric_in_offset_sign(
        offset_ms in 0.0..500.0f64,
        tolerance_ms in 1.0..200.0f64,
    ) {
        let positive = quality_from_offset(offset_ms, tolerance_ms);
        let negative = quality_from_offset(-offset_ms, tolerance_ms);
        prop_assert_eq!(positive, negative);
    }
}
