use crate::io::granule::band_tag;
use crate::types::{
    ArtifactStatus, ExportArtifact, ExportFormat, MisrResult, ProcessingConfig, RasterTile,
    EXPORT_NODATA,
};
use chrono::Utc;
use gdal::raster::RasterCreationOption;
use gdal::{DriverManager, Metadata};
use std::fs;
use std::path::{Path, PathBuf};

/// Serializes tiles to the enabled output formats with consistent metadata
///
/// Writes are atomic: each artifact is written under a temporary name and
/// renamed into place, so a crash never leaves a partial file behind.
pub struct ExportManager {
    output_dir: PathBuf,
}

impl ExportManager {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(&config.output_directory)
    }

    /// Build the output stem: `<stem>_<band>[_qa][_clipped][_timestamp]`
    pub fn create_filename(&self, stem: &str, config: &ProcessingConfig) -> String {
        let mut parts = vec![stem.to_string(), band_tag(&config.field_name)];
        if config.enable_qa_filtering {
            parts.push("qa".to_string());
        }
        if config.enable_clipping {
            parts.push("clipped".to_string());
        }
        if config.add_timestamp {
            parts.push(Utc::now().format("%Y%m%d_%H%M%S").to_string());
        }
        parts.join("_")
    }

    /// Export one tile to every enabled format
    ///
    /// A failure on one artifact never aborts the others; each artifact
    /// reports its own status. Only an unusable output directory is fatal.
    pub fn export(
        &self,
        tile: &RasterTile,
        config: &ProcessingConfig,
        destination_stem: &str,
    ) -> MisrResult<Vec<ExportArtifact>> {
        fs::create_dir_all(&self.output_dir)?;

        let filename = self.create_filename(destination_stem, config);
        let mut artifacts = Vec::new();

        for format in config.export_formats() {
            let path = self
                .output_dir
                .join(format!("{}.{}", filename, format.extension()));

            if path.exists() && !config.overwrite_existing {
                log::warn!(
                    "Skipping existing {} artifact: {}",
                    format,
                    path.display()
                );
                artifacts.push(ExportArtifact {
                    format,
                    path,
                    status: ArtifactStatus::SkippedExisting,
                });
                continue;
            }

            let status = match self.write_raster(tile, &path, format) {
                Ok(()) => {
                    let size_mb = fs::metadata(&path)
                        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
                        .unwrap_or(0.0);
                    log::info!("Exported {}: {} ({:.1} MB)", format, path.display(), size_mb);
                    ArtifactStatus::Written
                }
                Err(e) => {
                    log::error!("Failed to export {} to {}: {}", format, path.display(), e);
                    ArtifactStatus::Failed(e.to_string())
                }
            };
            artifacts.push(ExportArtifact {
                format,
                path,
                status,
            });
        }

        Ok(artifacts)
    }

    fn write_raster(&self, tile: &RasterTile, path: &Path, format: ExportFormat) -> MisrResult<()> {
        let tmp_path = temp_sibling(path);
        let result = self.write_raster_to(tile, &tmp_path, format);
        match result {
            Ok(()) => {
                fs::rename(&tmp_path, path)?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn write_raster_to(
        &self,
        tile: &RasterTile,
        path: &Path,
        format: ExportFormat,
    ) -> MisrResult<()> {
        let driver = DriverManager::get_driver_by_name(format.driver())?;
        let (height, width) = tile.data.dim();

        let mut dataset = match format {
            ExportFormat::GeoTiff => driver.create_with_band_type_with_options::<f32, _>(
                path,
                width as isize,
                height as isize,
                1,
                &[RasterCreationOption {
                    key: "COMPRESS",
                    value: "LZW",
                }],
            )?,
            ExportFormat::NetCdf => {
                driver.create_with_band_type::<f32, _>(path, width as isize, height as isize, 1)?
            }
        };

        dataset.set_geo_transform(&tile.region.geo_transform())?;
        dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(4326)?)?;

        dataset.set_metadata_item(
            "DESCRIPTION",
            &format!("MISR {} reprojected to WGS84", tile.band_name),
            "",
        )?;
        dataset.set_metadata_item(
            "SOURCE_FILE",
            &tile
                .source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            "",
        )?;
        dataset.set_metadata_item("FIELD", &tile.band_name, "")?;
        if let Some(units) = &tile.units {
            dataset.set_metadata_item("UNITS", units, "")?;
        }
        dataset.set_metadata_item("COORDINATE_SYSTEM", "WGS84 (EPSG:4326)", "")?;

        // Substitute the nodata sentinel for NaN on the way out
        let flat_data: Vec<f32> = tile
            .data
            .iter()
            .map(|&v| if v.is_finite() { v } else { EXPORT_NODATA })
            .collect();
        let buffer = gdal::raster::Buffer::new((width, height), flat_data);
        let mut rasterband = dataset.rasterband(1)?;
        rasterband.write((0, 0), (width, height), &buffer)?;
        rasterband.set_no_data_value(Some(EXPORT_NODATA as f64))?;

        Ok(())
    }
}

/// Temporary name in the same directory, so the final rename is atomic
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{}.partial", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, RegionSpec};
    use ndarray::array;
    use std::path::PathBuf;

    fn test_tile() -> RasterTile {
        RasterTile {
            data: array![[1.0f32, 2.0], [f32::NAN, 4.0]],
            qa: None,
            region: RegionSpec {
                bbox: BoundingBox {
                    min_lat: 50.0,
                    max_lat: 51.0,
                    min_lon: -118.0,
                    max_lon: -117.0,
                },
                resolution: 0.5,
                rows: 2,
                cols: 2,
            },
            band_name: "red_radiance".to_string(),
            units: Some("W/m²/sr/μm".to_string()),
            source: PathBuf::from("MISR_AM1_GRP_TERRAIN_GM_P043_O120540_AN.nc"),
        }
    }

    fn config_no_timestamp() -> ProcessingConfig {
        ProcessingConfig {
            add_timestamp: false,
            ..ProcessingConfig::default()
        }
    }

    #[test]
    fn test_create_filename_parts() {
        let manager = ExportManager::new(".");
        let mut config = config_no_timestamp();
        assert_eq!(manager.create_filename("granule", &config), "granule_red");

        config.enable_qa_filtering = true;
        config.enable_clipping = true;
        assert_eq!(
            manager.create_filename("granule", &config),
            "granule_red_qa_clipped"
        );
    }

    #[test]
    fn test_timestamp_suffix_appended() {
        let manager = ExportManager::new(".");
        let config = ProcessingConfig::default();
        let name = manager.create_filename("granule", &config);
        assert!(name.starts_with("granule_red_"));
        // YYYYMMDD_HHMMSS
        assert_eq!(name.len(), "granule_red_".len() + 15);
    }

    #[test]
    fn test_existing_artifact_skipped_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExportManager::new(dir.path());
        let config = config_no_timestamp();

        std::fs::write(dir.path().join("granule_red.tif"), b"sentinel").unwrap();
        let artifacts = manager.export(&test_tile(), &config, "granule").unwrap();

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].status, ArtifactStatus::SkippedExisting);
        // Existing file untouched
        let contents = std::fs::read(dir.path().join("granule_red.tif")).unwrap();
        assert_eq!(contents, b"sentinel");
    }

    #[test]
    fn test_geotiff_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExportManager::new(dir.path());
        let config = config_no_timestamp();

        let artifacts = manager.export(&test_tile(), &config, "granule").unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].status, ArtifactStatus::Written);

        let dataset = gdal::Dataset::open(&artifacts[0].path).unwrap();
        assert_eq!(dataset.raster_size(), (2, 2));
        let band = dataset.rasterband(1).unwrap();
        assert_eq!(band.no_data_value(), Some(EXPORT_NODATA as f64));
        let data = band.read_as::<f32>((0, 0), (2, 2), (2, 2), None).unwrap();
        assert_eq!(data.data[0], 1.0);
        assert_eq!(data.data[2], EXPORT_NODATA);

        let gt = dataset.geo_transform().unwrap();
        assert_eq!(gt[0], -118.0);
        assert_eq!(gt[3], 51.0);
    }

    #[test]
    fn test_overwrite_yields_identical_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExportManager::new(dir.path());
        let config = ProcessingConfig {
            overwrite_existing: true,
            ..config_no_timestamp()
        };

        let first = manager.export(&test_tile(), &config, "granule").unwrap();
        let bytes_first = std::fs::read(&first[0].path).unwrap();
        let second = manager.export(&test_tile(), &config, "granule").unwrap();
        let bytes_second = std::fs::read(&second[0].path).unwrap();

        assert_eq!(second[0].status, ArtifactStatus::Written);
        assert_eq!(bytes_first, bytes_second);
    }

    #[test]
    fn test_no_partial_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ExportManager::new(dir.path());
        let config = config_no_timestamp();

        manager.export(&test_tile(), &config, "granule").unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

}
