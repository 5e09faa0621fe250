// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use log::info;

use crate::message::PixelFormat;

// An input pixel above this value is treated as a saturating contributor
// when binning.
pub const SATURATION_THRESHOLD: u16 = 65530;
const SATURATED: u32 = 65535;

/// Requested readout region. 0-origin, inclusive bounds, measured from the
/// sensor's bottom-left corner (inverted from some vendor conventions).
/// All-zero means full frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Subframe {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl Subframe {
    pub fn is_full_frame(&self) -> bool {
        self.top == 0 && self.bottom == 0 && self.left == 0 && self.right == 0
    }
}

/// Sensor geometry needed to resolve a subframe request.
#[derive(Debug, Clone, Copy)]
pub struct SensorGeometry {
    pub max_width: u32,
    pub max_height: u32,
    // Leading columns that never see light.
    pub overscan_width: u32,
    // Rows at and above this index are optically black.
    pub optic_black_edge: u32,
}

impl SensorGeometry {
    pub fn usable_width(&self) -> u32 {
        self.max_width - self.overscan_width
    }
    pub fn usable_height(&self) -> u32 {
        self.optic_black_edge.min(self.max_height)
    }
}

/// The region actually programmed into the device, plus the client-visible
/// corner recorded in the FITS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub device_left: u32,
    pub device_bottom: u32,
    pub width: u32,
    pub height: u32,
    // Requested corner, before the overscan shift.
    pub corner_x: u32,
    pub corner_y: u32,
}

/// Applies the subframe policy: all-zero selects the whole usable sensor;
/// out-of-range requests are clamped rather than rejected; the left edge is
/// shifted past the overscan columns when programming the device.
pub fn resolve_subframe(geom: &SensorGeometry, req: &Subframe) -> ResolvedFrame {
    let full = ResolvedFrame {
        device_left: geom.overscan_width,
        device_bottom: 0,
        width: geom.usable_width(),
        height: geom.usable_height(),
        corner_x: 0,
        corner_y: 0,
    };
    if req.is_full_frame() || req.right < req.left || req.top < req.bottom {
        return full;
    }
    let left = req.left.min(geom.usable_width() - 1);
    let bottom = req.bottom.min(geom.usable_height() - 1);
    let mut width = req.right - req.left + 1;
    let mut height = req.top - req.bottom + 1;
    let device_left = left + geom.overscan_width;
    if device_left + width > geom.max_width {
        width = geom.max_width - device_left;
    }
    if bottom + height > geom.usable_height() {
        height = geom.usable_height() - bottom;
    }
    ResolvedFrame {
        device_left,
        device_bottom: bottom,
        width,
        height,
        corner_x: left,
        corner_y: bottom,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BinnedData {
    U16(Vec<u16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

impl BinnedData {
    pub fn len(&self) -> usize {
        match self {
            BinnedData::U16(v) => v.len(),
            BinnedData::U32(v) => v.len(),
            BinnedData::F32(v) => v.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinnedFrame {
    pub width: usize,
    pub height: usize,
    pub binning: usize,
    pub format: PixelFormat,
    pub saturated_count: usize,
    pub data: BinnedData,
}

impl BinnedFrame {
    /// Largest linear ADU value for this frame's format and binning.
    pub fn data_max(&self) -> f64 {
        match self.format {
            PixelFormat::U16 => SATURATION_THRESHOLD as f64,
            PixelFormat::U32 | PixelFormat::F32 =>
                SATURATION_THRESHOLD as f64 * (self.binning * self.binning) as f64,
        }
    }
}

/// Software binning of an unbinned 16-bit sensor frame. Binning is never
/// done in the device. Output dimensions are ceil(width/bin) by
/// ceil(height/bin); a partial edge block sums only in-range pixels.
///
/// Saturation: a block counts as saturated when any contributor exceeds
/// 65530 (U32/F32) or additionally when the summed value exceeds 65535
/// (U16). Saturated U16 outputs clamp to 65535; U32/F32 clamp to
/// 65535*bin^2.
pub fn bin_frame(pixels: &[u16], width: usize, height: usize,
                 bin: usize, format: PixelFormat) -> BinnedFrame {
    assert!(bin >= 1);
    assert_eq!(pixels.len(), width * height);
    if bin == 1 {
        // 16-bit pixels pass straight through regardless of the requested
        // output format.
        return BinnedFrame {
            width,
            height,
            binning: 1,
            format: PixelFormat::U16,
            saturated_count: 0,
            data: BinnedData::U16(pixels.to_vec()),
        };
    }
    let tgt_w = width.div_ceil(bin);
    let tgt_h = height.div_ceil(bin);
    let mut num_saturated = 0usize;

    let mut out_u16 = Vec::new();
    let mut out_u32 = Vec::new();
    let mut out_f32 = Vec::new();
    match format {
        PixelFormat::U16 => out_u16.reserve(tgt_w * tgt_h),
        PixelFormat::U32 => out_u32.reserve(tgt_w * tgt_h),
        PixelFormat::F32 => out_f32.reserve(tgt_w * tgt_h),
    }
    let saturated_value = SATURATED * (bin * bin) as u32;

    for row in 0..tgt_h {
        for col in 0..tgt_w {
            let mut sum: u32 = 0;
            let mut overflow = false;
            for b in 0..bin {
                let y = row * bin + b;
                if y >= height {
                    break;
                }
                for bb in 0..bin {
                    let x = col * bin + bb;
                    if x >= width {
                        break;
                    }
                    let v = pixels[y * width + x];
                    overflow |= v > SATURATION_THRESHOLD;
                    sum += v as u32;
                }
            }
            match format {
                PixelFormat::U16 => {
                    if overflow || sum > SATURATED {
                        num_saturated += 1;
                        sum = SATURATED;
                    }
                    out_u16.push(sum as u16);
                },
                PixelFormat::U32 => {
                    if overflow {
                        num_saturated += 1;
                        sum = saturated_value;
                    }
                    out_u32.push(sum);
                },
                PixelFormat::F32 => {
                    if overflow {
                        num_saturated += 1;
                        sum = saturated_value;
                    }
                    out_f32.push(sum as f32);
                },
            }
        }
    }
    info!("Completed binning with {} saturated", num_saturated);
    BinnedFrame {
        width: tgt_w,
        height: tgt_h,
        binning: bin,
        format,
        saturated_count: num_saturated,
        data: match format {
            PixelFormat::U16 => BinnedData::U16(out_u16),
            PixelFormat::U32 => BinnedData::U32(out_u32),
            PixelFormat::F32 => BinnedData::F32(out_f32),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> SensorGeometry {
        SensorGeometry {
            max_width: 6280,
            max_height: 4240,
            overscan_width: 34,
            optic_black_edge: 4179,
        }
    }

    #[test]
    fn test_zero_subframe_selects_usable_sensor() {
        let geom = geometry();
        let zero = resolve_subframe(&geom, &Subframe::default());
        // {0,0,0,0} must match an explicit request for the whole usable
        // region.
        let explicit = resolve_subframe(&geom, &Subframe {
            bottom: 0,
            top: geom.optic_black_edge - 1,
            left: 0,
            right: geom.max_width - geom.overscan_width - 1,
        });
        assert_eq!(zero, explicit);
        assert_eq!(zero.width, 6280 - 34);
        assert_eq!(zero.height, 4179);
        assert_eq!(zero.device_left, 34);
    }

    #[test]
    fn test_out_of_range_subframe_clamped() {
        let geom = geometry();
        let resolved = resolve_subframe(&geom, &Subframe {
            bottom: 4000, top: 5000, left: 6000, right: 7000,
        });
        assert_eq!(resolved.device_left, 6034);
        assert_eq!(resolved.width, 6280 - 6034);
        assert_eq!(resolved.height, 4179 - 4000);
    }

    #[test]
    fn test_bin1_pass_through() {
        let pixels: Vec<u16> = (0..16u16).collect();
        let frame = bin_frame(&pixels, 4, 4, 1, PixelFormat::U32);
        assert_eq!(frame.format, PixelFormat::U16);
        assert_eq!(frame.data, BinnedData::U16(pixels));
        assert_eq!(frame.width * frame.height, 16);
        assert_eq!(frame.saturated_count, 0);
    }

    #[test]
    fn test_bin2_u32_saturation() {
        // 16x16 frame; one 2x2 block contains a 65531 contributor.
        let mut pixels = vec![100u16; 16 * 16];
        pixels[3 * 16 + 5] = 65531;
        let frame = bin_frame(&pixels, 16, 16, 2, PixelFormat::U32);
        assert_eq!(frame.width, 8);
        assert_eq!(frame.height, 8);
        assert_eq!(frame.saturated_count, 1);
        match &frame.data {
            BinnedData::U32(v) => {
                // Output block (row 1, col 2) saturates to 65535*4.
                assert_eq!(v[8 + 2], 65535 * 4);
                assert_eq!(v[0], 400);
            },
            _ => panic!("wrong output format"),
        }
        assert_eq!(frame.data_max(), 65530.0 * 4.0);
    }

    #[test]
    fn test_bin2_u16_sum_saturation() {
        // No single contributor exceeds the threshold, but the block sum
        // exceeds 65535.
        let pixels = vec![20000u16; 4 * 4];
        let frame = bin_frame(&pixels, 4, 4, 2, PixelFormat::U16);
        assert_eq!(frame.saturated_count, 4);
        match &frame.data {
            BinnedData::U16(v) => assert!(v.iter().all(|&p| p == 65535)),
            _ => panic!("wrong output format"),
        }
        assert_eq!(frame.data_max(), 65530.0);
    }

    #[test]
    fn test_partial_edge_blocks() {
        // 5x5 frame binned 2x2 -> ceil gives 3x3 output.
        let pixels = vec![10u16; 5 * 5];
        let frame = bin_frame(&pixels, 5, 5, 2, PixelFormat::U32);
        assert_eq!((frame.width, frame.height), (3, 3));
        match &frame.data {
            BinnedData::U32(v) => {
                assert_eq!(v[0], 40);      // full block
                assert_eq!(v[2], 20);      // right edge, 1x2
                assert_eq!(v[8], 10);      // corner, 1x1
            },
            _ => panic!("wrong output format"),
        }
    }

    #[test]
    fn test_binned_pixel_count_matches_ceil() {
        for (w, h, bin) in [(16, 16, 2), (17, 9, 4), (100, 30, 3)] {
            let pixels = vec![1u16; w * h];
            let frame = bin_frame(&pixels, w, h, bin, PixelFormat::F32);
            assert_eq!(frame.data.len(), w.div_ceil(bin) * h.div_ceil(bin));
        }
    }

}  // mod tests.
