//! Resize and crop math for size variants.
//!
//! Scales are kept as exact fractions so that `ceil`/`floor` never drift by a
//! pixel on ratios like 200/1000.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantGeometry {
    pub width: u32,
    pub height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
}

#[derive(Debug, Clone, Copy)]
struct Ratio {
    num: u64,
    den: u64,
}

impl Ratio {
    fn new(num: u32, den: u32) -> Self {
        Self {
            num: u64::from(num),
            den: u64::from(den),
        }
    }

    fn greater_than(self, other: Ratio) -> bool {
        self.num * other.den > other.num * self.den
    }

    fn scale_ceil(self, value: u32) -> u32 {
        let scaled = (u64::from(value) * self.num).div_ceil(self.den);
        u32::try_from(scaled).unwrap_or(u32::MAX)
    }

    fn scale_floor(self, value: u32) -> u32 {
        let scaled = u64::from(value) * self.num / self.den;
        u32::try_from(scaled).unwrap_or(u32::MAX)
    }
}

/// Target dimensions (and center-crop offsets) of a variant.
///
/// With `crop` the image is scaled to cover the target box and the offsets
/// center it; without `crop` it is scaled to fit inside the box and never
/// upscaled. A zero target dimension leaves that axis unconstrained.
pub fn compute_variant(
    orig_w: u32,
    orig_h: u32,
    target_w: u32,
    target_h: u32,
    crop: bool,
) -> VariantGeometry {
    let identity = VariantGeometry {
        width: orig_w,
        height: orig_h,
        crop_x: 0,
        crop_y: 0,
    };
    if (target_w == 0 && target_h == 0) || orig_w == 0 || orig_h == 0 {
        return identity;
    }

    let candidates = [
        (target_w > 0).then(|| Ratio::new(target_w, orig_w)),
        (target_h > 0).then(|| Ratio::new(target_h, orig_h)),
    ];
    let mut ratios = candidates.into_iter().flatten();
    let Some(first) = ratios.next() else {
        return identity;
    };

    if crop {
        let scale = ratios.fold(first, |acc, r| if r.greater_than(acc) { r } else { acc });
        let width = scale.scale_ceil(orig_w);
        let height = scale.scale_ceil(orig_h);
        VariantGeometry {
            width,
            height,
            crop_x: width.saturating_sub(target_w) / 2,
            crop_y: height.saturating_sub(target_h) / 2,
        }
    } else {
        let mut scale = ratios.fold(first, |acc, r| if acc.greater_than(r) { r } else { acc });
        if scale.num > scale.den {
            scale = Ratio { num: 1, den: 1 };
        }
        VariantGeometry {
            width: scale.scale_floor(orig_w),
            height: scale.scale_floor(orig_h),
            crop_x: 0,
            crop_y: 0,
        }
    }
}

/// Dimensions after bounding the longer side to `threshold`, or `None` when
/// the image already fits.
pub fn fit_longest_side(width: u32, height: u32, threshold: u32) -> Option<(u32, u32)> {
    if threshold == 0 || width.max(height) <= threshold {
        return None;
    }
    if width >= height {
        let h = Ratio::new(threshold, width).scale_floor(height).max(1);
        Some((threshold, h))
    } else {
        let w = Ratio::new(threshold, height).scale_floor(width).max(1);
        Some((w, threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(g: VariantGeometry) -> (u32, u32, u32, u32) {
        (g.width, g.height, g.crop_x, g.crop_y)
    }

    #[test]
    fn crop_covers_the_box_and_centers() {
        assert_eq!(dims(compute_variant(1000, 500, 200, 200, true)), (400, 200, 100, 0));
        assert_eq!(dims(compute_variant(500, 1000, 150, 150, true)), (150, 300, 0, 75));
    }

    #[test]
    fn fit_takes_the_smaller_scale() {
        assert_eq!(dims(compute_variant(1000, 500, 200, 200, false)), (200, 100, 0, 0));
    }

    #[test]
    fn fit_never_upscales() {
        assert_eq!(dims(compute_variant(100, 100, 500, 500, false)), (100, 100, 0, 0));
    }

    #[test]
    fn zero_targets_are_identity() {
        assert_eq!(dims(compute_variant(640, 480, 0, 0, true)), (640, 480, 0, 0));
        assert_eq!(dims(compute_variant(640, 480, 0, 0, false)), (640, 480, 0, 0));
    }

    #[test]
    fn single_axis_constraints() {
        // width-only: height follows the aspect ratio
        assert_eq!(dims(compute_variant(2000, 1000, 768, 0, false)), (768, 384, 0, 0));
        // height-only crop scales from the height ratio
        assert_eq!(dims(compute_variant(1000, 500, 0, 100, true)), (200, 100, 100, 0));
    }

    #[test]
    fn crop_rounds_up_fractional_sizes() {
        // 333 * 150/200 = 249.75
        assert_eq!(dims(compute_variant(333, 200, 150, 150, true)), (250, 150, 50, 0));
    }

    #[test]
    fn fit_longest_side_bounds_landscape_and_portrait() {
        assert_eq!(fit_longest_side(4000, 3000, 2048), Some((2048, 1536)));
        assert_eq!(fit_longest_side(3000, 4000, 2048), Some((1536, 2048)));
        assert_eq!(fit_longest_side(2048, 100, 2048), None);
        assert_eq!(fit_longest_side(10_000, 1, 100), Some((100, 1)));
    }
}
