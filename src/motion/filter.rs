//! Mask denoising.
//!
//! Background subtraction leaves salt-and-pepper speckle from sensor noise.
//! A 5x5 median filter over the binary mask removes isolated specks while
//! keeping solid moving regions, so the foreground fraction reflects actual
//! motion rather than grain.

use crate::motion::model::ForegroundMask;

/// Median filter kernel edge; 5 matches the speckle size of typical streams.
pub const DENOISE_KERNEL: u32 = 5;

/// Applies a `kernel` x `kernel` median filter to a binary mask. On a
/// two-valued image the median is a majority vote over the window. Borders
/// replicate the nearest edge pixel.
pub fn median_denoise(mask: &ForegroundMask, kernel: u32) -> ForegroundMask {
    let w = mask.width() as i64;
    let h = mask.height() as i64;
    if w == 0 || h == 0 || kernel <= 1 {
        return mask.clone();
    }
    let reach = (kernel / 2) as i64;
    let window = (kernel as usize) * (kernel as usize);
    let majority = window / 2;
    let src = mask.data();

    let mut out = vec![0u8; src.len()];
    for y in 0..h {
        for x in 0..w {
            let mut set = 0usize;
            for dy in -reach..=reach {
                let sy = (y + dy).clamp(0, h - 1);
                let row = (sy * w) as usize;
                for dx in -reach..=reach {
                    let sx = (x + dx).clamp(0, w - 1);
                    if src[row + sx as usize] != 0 {
                        set += 1;
                    }
                }
            }
            if set > majority {
                out[(y * w + x) as usize] = 255;
            }
        }
    }
    // Geometry is unchanged, so the buffer always matches.
    ForegroundMask::new(mask.width(), mask.height(), out)
        .unwrap_or_else(|_| mask.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(w: u32, h: u32, data: Vec<u8>) -> ForegroundMask {
        ForegroundMask::new(w, h, data).unwrap()
    }

    #[test]
    fn removes_an_isolated_speck() {
        let mut data = vec![0u8; 100];
        data[55] = 255;
        let out = median_denoise(&mask_from(10, 10, data), DENOISE_KERNEL);
        assert_eq!(out.foreground_fraction(), 0.0);
    }

    #[test]
    fn keeps_a_solid_region() {
        // 6x6 block in a 12x12 mask survives the filter mostly intact.
        let mut data = vec![0u8; 144];
        for y in 3..9 {
            for x in 3..9 {
                data[y * 12 + x] = 255;
            }
        }
        let out = median_denoise(&mask_from(12, 12, data), DENOISE_KERNEL);
        let fraction = out.foreground_fraction();
        assert!(fraction > 0.15, "solid region was erased: {}", fraction);
    }

    #[test]
    fn fills_a_pinhole_inside_a_region() {
        let mut data = vec![255u8; 100];
        data[44] = 0;
        let out = median_denoise(&mask_from(10, 10, data), DENOISE_KERNEL);
        assert_eq!(out.foreground_fraction(), 1.0);
    }

    #[test]
    fn kernel_of_one_is_identity() {
        let mut data = vec![0u8; 100];
        data[7] = 255;
        let out = median_denoise(&mask_from(10, 10, data.clone()), 1);
        assert_eq!(out.data(), &data[..]);
    }

    #[test]
    fn empty_and_full_masks_are_fixed_points() {
        let empty = mask_from(8, 8, vec![0; 64]);
        assert_eq!(median_denoise(&empty, DENOISE_KERNEL).foreground_fraction(), 0.0);
        let full = mask_from(8, 8, vec![255; 64]);
        assert_eq!(median_denoise(&full, DENOISE_KERNEL).foreground_fraction(), 1.0);
    }
}
