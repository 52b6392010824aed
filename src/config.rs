//! TOML configuration of an overlap run and of lookup reclassification.

use crate::error::{OverlayError, Result};
use crate::load::GEOMETRY_COLUMN;
use crate::types::{ClassValue, Ident};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Placeholder replaced by the class code in [`PerClassFields::template`].
pub const CLASS_PLACEHOLDER: &str = "{class}";

const AREA_ROLE: &str = "area_field";

fn default_geom() -> Ident {
    Ident::new_unchecked(GEOMETRY_COLUMN)
}

fn default_true() -> bool {
    true
}

/// Everything one `overlay run` needs.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Store file; created when missing.
    pub database: PathBuf,
    /// Cache loaded layers as Parquet next to the store.
    #[serde(default = "default_true")]
    pub staging: bool,
    #[serde(default)]
    pub layers: Vec<LayerSource>,
    /// Raw WKB columns to turn into geometry columns after loading.
    #[serde(default)]
    pub convert_blob: Vec<BlobConversion>,
    pub study_area: StudyAreaConfig,
    #[serde(default)]
    pub references: Vec<ReferenceConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub export: Option<ExportConfig>,
    pub lookup: Option<LookupConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSource {
    pub gpkg: PathBuf,
    pub layer: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlobConversion {
    pub table: Ident,
    pub blob_field: Ident,
    #[serde(default = "default_geom")]
    pub geom_field: Ident,
    #[serde(default)]
    pub srs_id: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyAreaConfig {
    pub table: Ident,
    pub id_field: Ident,
    #[serde(default = "default_geom")]
    pub geom_field: Ident,
}

/// One classified reference table and the overlap fields computed from it.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceConfig {
    pub table: Ident,
    pub class_field: Ident,
    #[serde(default = "default_geom")]
    pub geom_field: Ident,
    /// One field per class, named from a template.
    pub per_class: Option<PerClassFields>,
    /// Fields summing several classes.
    #[serde(default)]
    pub fields: Vec<OverlapField>,
    /// Sum of the per-class fields, or of `fields` when there is no
    /// `per_class`.
    pub sum_field: Option<Ident>,
    /// Study polygon area.
    pub area_field: Option<Ident>,
    /// `sum_field - area_field`.
    pub diff_field: Option<Ident>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerClassFields {
    /// Field name with a `{class}` placeholder, e.g. `ar50_bon{class}_m2`.
    pub template: String,
    pub classes: Vec<ClassValue>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlapField {
    pub name: Ident,
    pub classes: Vec<ClassValue>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    pub perimeter_field: Option<Ident>,
    pub shape_index_field: Option<Ident>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    pub gpkg: Option<PathBuf>,
    /// Layer name in the exported GeoPackage; defaults to the study table.
    pub layer: Option<String>,
    pub csv: Option<PathBuf>,
}

/// CSV lookup used by `overlay reclassify`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LookupConfig {
    pub csv: PathBuf,
    pub keys: Vec<String>,
    pub value: String,
    /// CSV header name to key name.
    #[serde(default)]
    pub rename: HashMap<String, String>,
}

impl PipelineConfig {
    /// Load a config file. Relative paths in it are resolved against the
    /// file's directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OverlayError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let study = &self.study_area;
        // Output column -> what writes it. The polygon area is the same
        // whichever reference asks for it, so only that one may repeat.
        let mut outputs: HashMap<Ident, &'static str> = HashMap::new();
        let mut claim = |field: &Ident, role: &'static str| -> Result<()> {
            if *field == study.id_field || *field == study.geom_field {
                return Err(OverlayError::InvalidArgument(format!(
                    "{role} {field} would overwrite a study area column"
                )));
            }
            match outputs.insert(field.clone(), role) {
                Some(previous) if !(previous == AREA_ROLE && role == AREA_ROLE) => {
                    Err(OverlayError::InvalidArgument(format!(
                        "{role} {field} is already configured as {previous}"
                    )))
                }
                _ => Ok(()),
            }
        };

        for reference in &self.references {
            for (field, _) in reference.overlap_fields()? {
                claim(&field, "overlap field")?;
            }
            if let Some(field) = &reference.sum_field {
                claim(field, "sum_field")?;
            }
            if let Some(field) = &reference.area_field {
                claim(field, AREA_ROLE)?;
            }
            if let Some(field) = &reference.diff_field {
                claim(field, "diff_field")?;
            }
            if reference.diff_field.is_some()
                && (reference.sum_field.is_none() || reference.area_field.is_none())
            {
                return Err(OverlayError::InvalidArgument(format!(
                    "reference {}: diff_field needs sum_field and area_field",
                    reference.table
                )));
            }
        }
        if let Some(field) = &self.metrics.perimeter_field {
            claim(field, "perimeter_field")?;
        }
        if let Some(field) = &self.metrics.shape_index_field {
            claim(field, "shape_index_field")?;
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.database);
        for layer in &mut self.layers {
            resolve(&mut layer.gpkg);
        }
        if let Some(export) = &mut self.export {
            if let Some(gpkg) = &mut export.gpkg {
                resolve(gpkg);
            }
            if let Some(csv) = &mut export.csv {
                resolve(csv);
            }
        }
        if let Some(lookup) = &mut self.lookup {
            resolve(&mut lookup.csv);
        }
    }
}

impl LookupConfig {
    /// Read the `[lookup]` table of a config file; other tables are ignored.
    /// A relative `csv` path is resolved against the file's directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        #[derive(Deserialize)]
        struct LookupFile {
            lookup: Option<LookupConfig>,
        }

        let path = path.as_ref();
        if !path.exists() {
            return Err(OverlayError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let file: LookupFile = toml::from_str(&std::fs::read_to_string(path)?)?;
        let mut lookup = file.lookup.ok_or_else(|| {
            OverlayError::InvalidArgument(format!("{} has no [lookup] table", path.display()))
        })?;
        if let Some(base) = path.parent() {
            if lookup.csv.is_relative() {
                lookup.csv = base.join(&lookup.csv);
            }
        }
        Ok(lookup)
    }
}

impl ReferenceConfig {
    /// Output fields with their class sets: templated per-class fields
    /// first, then the explicit ones.
    pub fn overlap_fields(&self) -> Result<Vec<(Ident, Vec<ClassValue>)>> {
        let mut fields = Vec::new();
        if let Some(per_class) = &self.per_class {
            if !per_class.template.contains(CLASS_PLACEHOLDER) {
                return Err(OverlayError::InvalidArgument(format!(
                    "per_class template {:?} lacks {CLASS_PLACEHOLDER}",
                    per_class.template
                )));
            }
            for class in &per_class.classes {
                let name = per_class
                    .template
                    .replace(CLASS_PLACEHOLDER, &class.to_string());
                fields.push((Ident::new(name)?, vec![class.clone()]));
            }
        }
        fields.extend(
            self.fields
                .iter()
                .map(|field| (field.name.clone(), field.classes.clone())),
        );
        Ok(fields)
    }

    /// Fields added up into `sum_field`.
    ///
    /// Explicit fields usually regroup per-class ones, so they only count
    /// when no per-class fields are configured.
    pub fn summed_fields(&self) -> Result<Vec<Ident>> {
        let fields = self.overlap_fields()?;
        let count = match &self.per_class {
            Some(per_class) => per_class.classes.len(),
            None => fields.len(),
        };
        Ok(fields.into_iter().take(count).map(|(name, _)| name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{LookupConfig, PipelineConfig};
    use crate::error::OverlayError;
    use crate::types::{ClassValue, Ident};
    use std::path::PathBuf;

    const CONFIG: &str = r#"
database = "interim/verg_og_bevaring.db"

[[layers]]
gpkg = "interim/plan_verneformal_25833.gpkg"
layer = "plan_verneformal"

[study_area]
table = "plan_verneformal"
id_field = "identifikasjon_lokalId"

[[references]]
table = "ar50_flate"
class_field = "ar50_bonitet"
sum_field = "sum_ar50_bon_m2"
area_field = "areal_m2"
diff_field = "area_diff_m2"
per_class = { template = "ar50_bon{class}_m2", classes = [1, 2, 3] }

  [[references.fields]]
  name = "ar50_skog_m2"
  classes = [11, 12]

[[references]]
table = "bioklima"
class_field = "sone"
fields = [{ name = "bioklima_nb_m2", classes = ["NB"] }]

[metrics]
shape_index_field = "formindeks"

[export]
csv = "processed/plan_verneformal_overlapp.csv"

[lookup]
csv = "AR50_bonitet_lookup.csv"
keys = ["artype", "arskogbon"]
value = "ar50_bonitet"
rename = { "ARTYPE kode" = "artype" }
"#;

    #[test]
    fn parses_full_config() -> crate::Result<()> {
        let config = PipelineConfig::from_toml(CONFIG)?;
        assert!(config.staging);
        assert_eq!(config.study_area.geom_field, Ident::new("geom")?);
        assert_eq!(config.references.len(), 2);
        assert_eq!(
            config.metrics.shape_index_field,
            Some(Ident::new("formindeks")?)
        );
        assert!(config.metrics.perimeter_field.is_none());

        let fields = config.references[0].overlap_fields()?;
        let names: Vec<&str> = fields.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            names,
            vec!["ar50_bon1_m2", "ar50_bon2_m2", "ar50_bon3_m2", "ar50_skog_m2"]
        );
        assert_eq!(
            fields[3].1,
            vec![ClassValue::Integer(11), ClassValue::Integer(12)]
        );
        assert_eq!(
            config.references[0].summed_fields()?,
            vec![
                Ident::new("ar50_bon1_m2")?,
                Ident::new("ar50_bon2_m2")?,
                Ident::new("ar50_bon3_m2")?
            ]
        );
        assert_eq!(
            config.references[1].summed_fields()?,
            vec![Ident::new("bioklima_nb_m2")?]
        );
        assert_eq!(
            config.references[1].overlap_fields()?[0].1,
            vec![ClassValue::Text("NB".to_string())]
        );

        let lookup = config.lookup.expect("lookup section");
        assert_eq!(lookup.rename.get("ARTYPE kode").map(String::as_str), Some("artype"));
        Ok(())
    }

    #[test]
    fn relative_paths_follow_config_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("overlay.toml");
        std::fs::write(&path, CONFIG)?;

        let config = PipelineConfig::from_path(&path)?;
        assert_eq!(config.database, dir.path().join("interim/verg_og_bevaring.db"));
        assert_eq!(
            config.export.and_then(|e| e.csv),
            Some(dir.path().join("processed/plan_verneformal_overlapp.csv"))
        );
        assert_eq!(
            config.lookup.map(|l| l.csv),
            Some(dir.path().join("AR50_bonitet_lookup.csv"))
        );
        Ok(())
    }

    #[test]
    fn lookup_section_reads_alone() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lookup.toml");
        std::fs::write(
            &path,
            "[lookup]\ncsv = \"bonitet.csv\"\nkeys = [\"artype\"]\nvalue = \"ar50_bonitet\"\n",
        )?;

        let lookup = LookupConfig::from_path(&path)?;
        assert_eq!(lookup.csv, dir.path().join("bonitet.csv"));
        assert_eq!(lookup.keys, vec!["artype".to_string()]);
        assert!(lookup.rename.is_empty());

        std::fs::write(&path, "database = \"x.db\"\n")?;
        assert!(matches!(
            LookupConfig::from_path(&path),
            Err(OverlayError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn invalid_identifier_is_rejected() {
        let text = CONFIG.replace("\"sone\"", "\"sone; DROP TABLE x\"");
        let err = PipelineConfig::from_toml(&text).expect_err("invalid identifier");
        assert!(matches!(err, OverlayError::Config(_)));
    }

    #[test]
    fn duplicate_or_untemplated_fields_are_rejected() {
        let text = CONFIG.replace("ar50_skog_m2", "ar50_bon1_m2");
        assert!(matches!(
            PipelineConfig::from_toml(&text),
            Err(OverlayError::InvalidArgument(_))
        ));

        let text = CONFIG.replace("ar50_bon{class}_m2", "ar50_bon_m2");
        assert!(matches!(
            PipelineConfig::from_toml(&text),
            Err(OverlayError::InvalidArgument(_))
        ));
    }

    #[test]
    fn colliding_outputs_are_rejected() -> crate::Result<()> {
        for (from, to) in [
            ("area_field = \"areal_m2\"", "area_field = \"sum_ar50_bon_m2\""),
            ("diff_field = \"area_diff_m2\"", "diff_field = \"Ar50_Bon2_m2\""),
            ("shape_index_field = \"formindeks\"", "shape_index_field = \"areal_m2\""),
            ("name = \"bioklima_nb_m2\"", "name = \"IDENTIFIKASJON_LOKALID\""),
        ] {
            let text = CONFIG.replace(from, to);
            let err = PipelineConfig::from_toml(&text).expect_err(to);
            assert!(matches!(err, OverlayError::InvalidArgument(_)), "{to}");
        }

        let text = CONFIG.replace(
            "class_field = \"sone\"\n",
            "class_field = \"sone\"\narea_field = \"areal_m2\"\n",
        );
        let config = PipelineConfig::from_toml(&text)?;
        assert_eq!(config.references[1].area_field, Some(Ident::new("areal_m2")?));
        Ok(())
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = PipelineConfig::from_path(PathBuf::from("/nonexistent/overlay.toml"))
            .expect_err("missing file");
        assert!(matches!(err, OverlayError::MissingFile { .. }));
    }
}
