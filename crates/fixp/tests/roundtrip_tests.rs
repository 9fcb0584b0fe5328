//! Round-trip law: a representable value converts back within one unit of
//! the declared fractional precision.

use fixp::FixedPoint;

#[test]
fn roundtrip_within_fractional_precision() {
    for &fb in &[4u32, 8, 16, 24] {
        let step = 1.0 / (1u32 << fb) as f64;
        let mut x = -100.0;
        while x < 100.0 {
            let v = FixedPoint::from_f64(x, 16, fb);
            assert!(!v.is_tagged(), "{x} tagged at {fb} fractional bits");
            let back = v.to_f32() as f64;
            assert!(
                (back - x).abs() <= step,
                "{x} -> {back} exceeds 2^-{fb}"
            );
            x += 1.371;
        }
    }
}

#[test]
fn exact_grid_points_are_lossless() {
    let fb = 8u32;
    for i in -512i32..512 {
        let x = i as f64 / 256.0;
        let v = FixedPoint::from_f64(x, 16, fb);
        assert_eq!(v.to_f64(), x, "grid point {x} must be exact");
    }
}

#[test]
fn arithmetic_stays_on_the_grid() {
    let fb = 16u32;
    let a = FixedPoint::from_f64(12.5, 16, fb);
    let b = FixedPoint::from_f64(-3.25, 16, fb);
    assert_eq!((a + b).to_f64(), 9.25);
    assert_eq!((a - b).to_f64(), 15.75);
    assert_eq!((a * b).to_f64(), -40.625);
}
