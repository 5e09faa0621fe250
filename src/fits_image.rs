// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, failed_precondition_error};
use chrono::{DateTime, Utc};
use fitsio::FitsFile;
use fitsio::images::{ImageDescription, ImageType};
use log::info;

use crate::frame::{BinnedData, BinnedFrame};
use crate::message::PixelFormat;

/// Header content for one exposure product. Pointing keywords (DEC-NOM,
/// RA-NOM, altitude, azimuth, airmass, hour angle) are appended by the
/// client after receipt, not here.
#[derive(Debug, Clone)]
pub struct FitsHeader {
    pub exposure_secs: f64,
    // Arcsec per unbinned pixel; CDELT1/2 scale with binning.
    pub pixel_scale_arcsec: f64,
    // Measured shutter-open-to-close interval, when both timestamps were
    // captured.
    pub exp_t1: Option<f64>,
    pub filter_name: Option<char>,
    pub date_obs: DateTime<Utc>,
    pub gain: i64,
    pub mode: i64,
    pub offset: i64,
    // Subframe corner, client coordinates.
    pub frame_x: u32,
    pub frame_y: u32,
    pub focal_length_mm: f64,
    pub camera: String,
    pub telescope: String,
}

/// System gain in e-/ADU, a piecewise-linear function of read mode and
/// gain setting calibrated for the reference sensor.
pub fn egain(mode: i64, gain: f64) -> f64 {
    match mode {
        0 => {
            if gain < 30.0 {
                1.58 - 0.03667 * gain
            } else if gain < 65.0 {
                0.8658 - 0.01286 * gain
            } else {
                0.06705 - 0.00057 * gain
            }
        },
        1 => 1.002 - 0.0098 * gain,
        2 => 1.543 - 0.0143 * gain,
        3 => 1.628 - 0.0153 * gain,
        _ => 0.0,
    }
}

fn fits_err(context: &str, e: fitsio::errors::Error) -> CanonicalError {
    failed_precondition_error(format!("{}: {}", context, e).as_str())
}

/// Writes the frame and header to `path`, replacing any existing file.
pub fn write_fits(path: &Path, frame: &BinnedFrame, header: &FitsHeader,
                  compress: bool) -> Result<(), CanonicalError> {
    let image_type = match frame.format {
        PixelFormat::U16 => ImageType::UnsignedShort,
        PixelFormat::U32 => ImageType::UnsignedLong,
        PixelFormat::F32 => ImageType::Float,
    };
    let description = ImageDescription {
        data_type: image_type,
        dimensions: &[frame.height, frame.width],
    };
    let path_spec = if compress {
        format!("{}[compress]", path.display())
    } else {
        path.display().to_string()
    };
    let mut fptr = FitsFile::create(&path_spec)
        .overwrite()
        .with_custom_primary(&description)
        .open()
        .map_err(|e| fits_err("fits create", e))?;
    {
        let hdu = fptr.primary_hdu().map_err(|e| fits_err("primary hdu", e))?;
        match &frame.data {
            BinnedData::U16(v) =>
                hdu.write_image(&mut fptr, v).map_err(|e| fits_err("write image", e))?,
            BinnedData::U32(v) =>
                hdu.write_image(&mut fptr, v).map_err(|e| fits_err("write image", e))?,
            BinnedData::F32(v) =>
                hdu.write_image(&mut fptr, v).map_err(|e| fits_err("write image", e))?,
        }

        let key = |k| move |e| fits_err(k, e);
        hdu.write_key(&mut fptr, "DATAMAX", frame.data_max())
            .map_err(key("DATAMAX"))?;
        hdu.write_key(&mut fptr, "EXPOSURE", header.exposure_secs)
            .map_err(key("EXPOSURE"))?;
        let cdelt = header.pixel_scale_arcsec * frame.binning as f64;
        hdu.write_key(&mut fptr, "CDELT1", cdelt).map_err(key("CDELT1"))?;
        hdu.write_key(&mut fptr, "CDELT2", cdelt).map_err(key("CDELT2"))?;
        if let Some(t1) = header.exp_t1 {
            hdu.write_key(&mut fptr, "EXP_T1", t1).map_err(key("EXP_T1"))?;
        }
        if let Some(filter) = header.filter_name {
            hdu.write_key(&mut fptr, "FILTER", filter.to_string())
                .map_err(key("FILTER"))?;
        }
        hdu.write_key(&mut fptr, "DATE-OBS",
                      header.date_obs.format("%Y-%m-%dT%H:%M:%S%.1f").to_string())
            .map_err(key("DATE-OBS"))?;
        hdu.write_key(&mut fptr, "CAMGAIN", header.gain).map_err(key("CAMGAIN"))?;
        hdu.write_key(&mut fptr, "READMODE", header.mode).map_err(key("READMODE"))?;
        hdu.write_key(&mut fptr, "EGAIN", egain(header.mode, header.gain as f64))
            .map_err(key("EGAIN"))?;
        hdu.write_key(&mut fptr, "OFFSET", header.offset).map_err(key("OFFSET"))?;
        hdu.write_key(&mut fptr, "BINNING", frame.binning as i64)
            .map_err(key("BINNING"))?;
        hdu.write_key(&mut fptr, "FRAMEX", header.frame_x as i64)
            .map_err(key("FRAMEX"))?;
        hdu.write_key(&mut fptr, "FRAMEY", header.frame_y as i64)
            .map_err(key("FRAMEY"))?;
        hdu.write_key(&mut fptr, "FOCALLEN", header.focal_length_mm)
            .map_err(key("FOCALLEN"))?;
        hdu.write_key(&mut fptr, "CAMERA", header.camera.clone())
            .map_err(key("CAMERA"))?;
        hdu.write_key(&mut fptr, "TELESCOP", header.telescope.clone())
            .map_err(key("TELESCOP"))?;
    }
    info!("Wrote {}x{} FITS product to {}", frame.width, frame.height,
          path.display());
    Ok(())
}

/// Encodes the frame to a scratch file and returns the raw file bytes. Used
/// when a client asked for an in-memory result (IMAGE=-).
pub fn encode_fits(frame: &BinnedFrame, header: &FitsHeader, compress: bool)
                   -> Result<Vec<u8>, CanonicalError> {
    let scratch = scratch_path();
    write_fits(&scratch, frame, header, compress)?;
    let bytes = std::fs::read(&scratch).map_err(
        |e| failed_precondition_error(
            format!("cannot read scratch FITS file: {}", e).as_str()))?;
    let _ = std::fs::remove_file(&scratch);
    Ok(bytes)
}

fn scratch_path() -> PathBuf {
    std::env::temp_dir().join(format!("nightwatch_scratch_{}.fits",
                                      std::process::id()))
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;
    use crate::frame::{bin_frame, Subframe, SensorGeometry, resolve_subframe};

    fn test_header() -> FitsHeader {
        FitsHeader {
            exposure_secs: 0.5,
            pixel_scale_arcsec: 0.56,
            exp_t1: Some(0.52),
            filter_name: Some('V'),
            date_obs: Utc::now(),
            gain: 10,
            mode: 0,
            offset: 5,
            frame_x: 0,
            frame_y: 0,
            focal_length_mm: 2800.0,
            camera: "SIM268M".to_string(),
            telescope: "C14".to_string(),
        }
    }

    fn temp_fits(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nightwatch_test_{}_{}.fits",
                                          name, std::process::id()))
    }

    #[test]
    fn test_egain_table() {
        assert_abs_diff_eq!(egain(0, 0.0), 1.58, epsilon = 1e-9);
        assert_abs_diff_eq!(egain(0, 30.0), 0.8658 - 0.01286 * 30.0, epsilon = 1e-9);
        assert_abs_diff_eq!(egain(0, 70.0), 0.06705 - 0.00057 * 70.0, epsilon = 1e-9);
        assert_abs_diff_eq!(egain(1, 10.0), 1.002 - 0.098, epsilon = 1e-9);
        assert_abs_diff_eq!(egain(2, 10.0), 1.543 - 0.143, epsilon = 1e-9);
        assert_abs_diff_eq!(egain(3, 10.0), 1.628 - 0.153, epsilon = 1e-9);
    }

    #[test]
    fn test_write_and_read_back() {
        let pixels = vec![1000u16; 64 * 32];
        let frame = bin_frame(&pixels, 64, 32, 1, PixelFormat::U16);
        let path = temp_fits("roundtrip");
        write_fits(&path, &frame, &test_header(), false).unwrap();

        let mut fptr = FitsFile::open(&path).unwrap();
        let hdu = fptr.primary_hdu().unwrap();
        if let fitsio::hdu::HduInfo::ImageInfo { shape, .. } = &hdu.info {
            assert_eq!(shape, &vec![32, 64]);
        } else {
            panic!("primary HDU is not an image");
        }
        let exposure: f64 = hdu.read_key(&mut fptr, "EXPOSURE").unwrap();
        assert_abs_diff_eq!(exposure, 0.5, epsilon = 1e-9);
        let binning: i64 = hdu.read_key(&mut fptr, "BINNING").unwrap();
        assert_eq!(binning, 1);
        let filter: String = hdu.read_key(&mut fptr, "FILTER").unwrap();
        assert_eq!(filter, "V");
        let data: Vec<u16> = hdu.read_image(&mut fptr).unwrap();
        assert_eq!(data.len(), 64 * 32);
        assert!(data.iter().all(|&p| p == 1000));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_full_frame_dimensions() {
        // A zero subframe resolves to the usable sensor; its FITS product
        // carries those dimensions.
        let geom = SensorGeometry {
            max_width: 200, max_height: 150, overscan_width: 10,
            optic_black_edge: 140,
        };
        let resolved = resolve_subframe(&geom, &Subframe::default());
        let pixels = vec![10u16;
                          (resolved.width * resolved.height) as usize];
        let frame = bin_frame(&pixels, resolved.width as usize,
                              resolved.height as usize, 1, PixelFormat::U16);
        let path = temp_fits("fullframe");
        write_fits(&path, &frame, &test_header(), false).unwrap();
        let mut fptr = FitsFile::open(&path).unwrap();
        let hdu = fptr.primary_hdu().unwrap();
        if let fitsio::hdu::HduInfo::ImageInfo { shape, .. } = &hdu.info {
            assert_eq!(shape, &vec![140, 190]);
        } else {
            panic!("primary HDU is not an image");
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_in_memory_encode() {
        let pixels = vec![500u16; 16 * 16];
        let frame = bin_frame(&pixels, 16, 16, 1, PixelFormat::U16);
        let bytes = encode_fits(&frame, &test_header(), false).unwrap();
        // FITS files start with the SIMPLE card and are a multiple of 2880
        // bytes.
        assert!(bytes.starts_with(b"SIMPLE"));
        assert_eq!(bytes.len() % 2880, 0);
    }

}  // mod tests.
