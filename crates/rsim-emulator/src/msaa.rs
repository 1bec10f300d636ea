//! Sample positions inside a pixel, as offsets from the pixel corner.

const PATTERN_1: [(f64, f64); 1] = [(0.5, 0.5)];
const PATTERN_2: [(f64, f64); 2] = [(0.25, 0.25), (0.75, 0.75)];
const PATTERN_4: [(f64, f64); 4] = [(0.375, 0.125), (0.875, 0.375), (0.125, 0.625), (0.625, 0.875)];
const PATTERN_8: [(f64, f64); 8] = [
    (0.5625, 0.3125),
    (0.4375, 0.6875),
    (0.8125, 0.5625),
    (0.3125, 0.1875),
    (0.1875, 0.8125),
    (0.0625, 0.4375),
    (0.6875, 0.9375),
    (0.9375, 0.0625),
];

/// Sample pattern for a sample count; unsupported counts fall back to the
/// next smaller supported pattern.
pub fn sample_positions(samples: usize) -> &'static [(f64, f64)] {
    match samples {
        0 | 1 => &PATTERN_1,
        2 | 3 => &PATTERN_2,
        4..=7 => &PATTERN_4,
        _ => &PATTERN_8,
    }
}
