//! Parquet cache of loaded layers.
//!
//! Reading a large GeoPackage layer is slow, so the first load of a layer
//! writes its features to a Parquet file and later runs read that instead.
//! The file holds `fid`, the GeoPackage geometry blob and one column per
//! property; the layer name, geometry type and SRS travel in the schema
//! metadata.

use crate::conversions::{geometry_type_from_str, layer_geometry_type_to_str};
use crate::error::{OverlayError, Result};
use crate::gpkg::GpkgFeature;
use crate::load::{FID_COLUMN, GEOMETRY_COLUMN, LayerData};
use crate::types::{ColumnSpec, ColumnType, SpatialRefSys};
use arrow_array::builder::{
    ArrayBuilder, BinaryBuilder, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow_array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float64Array, Int64Array, RecordBatch,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rusqlite::types::Value;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

const META_LAYER_NAME: &str = "gpkg_overlay.layer_name";
const META_GEOMETRY_TYPE: &str = "gpkg_overlay.geometry_type";
const META_SRS: &str = "gpkg_overlay.srs";

const BATCH_SIZE: usize = 8192;

/// Write a layer to a Parquet file, replacing any existing file.
pub fn write_layer<P: AsRef<Path>>(path: P, data: &LayerData) -> Result<()> {
    let schema = arrow_schema_for(data)?;
    let file = File::create(path.as_ref())?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), None)?;

    for chunk in data.features.chunks(BATCH_SIZE) {
        let mut builder = StagingBatchBuilder::new(schema.clone(), &data.columns, chunk.len());
        for feature in chunk {
            builder.push(feature)?;
        }
        writer.write(&builder.finish()?)?;
    }
    writer.close()?;

    tracing::debug!(
        path = %path.as_ref().display(),
        layer = data.layer_name,
        features = data.features.len(),
        "wrote staging file"
    );
    Ok(())
}

/// Read a layer back from a Parquet file written by [`write_layer`].
pub fn read_layer<P: AsRef<Path>>(path: P) -> Result<LayerData> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(OverlayError::MissingFile {
            path: path.to_path_buf(),
        });
    }

    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let schema = builder.schema().clone();
    let metadata = schema.metadata();

    let layer_name = metadata_value(metadata, META_LAYER_NAME)?.to_string();
    let geometry_type = geometry_type_from_str(metadata_value(metadata, META_GEOMETRY_TYPE)?)?;
    let srs: SpatialRefSys = serde_json::from_str(metadata_value(metadata, META_SRS)?)?;

    let fields = schema.fields();
    if fields.len() < 2 || fields[0].name() != FID_COLUMN || fields[1].name() != GEOMETRY_COLUMN {
        return Err(OverlayError::InvalidArgument(format!(
            "{} is not a staging file",
            path.display()
        )));
    }
    let columns = fields[2..]
        .iter()
        .map(|field| {
            Ok(ColumnSpec {
                name: field.name().clone(),
                column_type: column_type_from_data_type(field.data_type())?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut features = Vec::new();
    for batch in builder.build()? {
        let batch = batch?;
        read_batch(&batch, &mut features)?;
    }

    Ok(LayerData {
        layer_name,
        geometry_type,
        srs,
        columns,
        features,
    })
}

fn arrow_schema_for(data: &LayerData) -> Result<SchemaRef> {
    let mut fields = vec![
        Field::new(FID_COLUMN, DataType::Int64, false),
        Field::new(GEOMETRY_COLUMN, DataType::Binary, true),
    ];
    fields.extend(
        data.columns
            .iter()
            .map(|col| Field::new(&col.name, data_type_for(col.column_type), true)),
    );

    let metadata = HashMap::from([
        (META_LAYER_NAME.to_string(), data.layer_name.clone()),
        (
            META_GEOMETRY_TYPE.to_string(),
            layer_geometry_type_to_str(data.geometry_type).to_string(),
        ),
        (META_SRS.to_string(), serde_json::to_string(&data.srs)?),
    ]);

    Ok(Arc::new(Schema::new_with_metadata(fields, metadata)))
}

fn data_type_for(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Varchar => DataType::Utf8,
        ColumnType::Double => DataType::Float64,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Geometry => DataType::Binary,
    }
}

fn column_type_from_data_type(data_type: &DataType) -> Result<ColumnType> {
    match data_type {
        DataType::Boolean => Ok(ColumnType::Boolean),
        DataType::Utf8 => Ok(ColumnType::Varchar),
        DataType::Float64 => Ok(ColumnType::Double),
        DataType::Int64 => Ok(ColumnType::Integer),
        DataType::Binary => Ok(ColumnType::Geometry),
        other => Err(OverlayError::InvalidArgument(format!(
            "unsupported staging column type {other}"
        ))),
    }
}

fn metadata_value<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| OverlayError::InvalidArgument(format!("staging file lacks {key} metadata")))
}

enum StagingArrayBuilder {
    Boolean(BooleanBuilder),
    Varchar(StringBuilder),
    Double(Float64Builder),
    Integer(Int64Builder),
    Binary(BinaryBuilder),
}

impl StagingArrayBuilder {
    fn new(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::Boolean => Self::Boolean(BooleanBuilder::with_capacity(capacity)),
            ColumnType::Varchar => {
                Self::Varchar(StringBuilder::with_capacity(capacity, 8 * capacity))
            }
            ColumnType::Double => Self::Double(Float64Builder::with_capacity(capacity)),
            ColumnType::Integer => Self::Integer(Int64Builder::with_capacity(capacity)),
            ColumnType::Geometry => {
                Self::Binary(BinaryBuilder::with_capacity(capacity, 64 * capacity))
            }
        }
    }

    // SQLite columns are loosely typed, so lossless conversions are accepted.
    fn push(&mut self, column: &str, value: &Value) -> Result<()> {
        match (self, value) {
            (Self::Boolean(builder), Value::Null) => builder.append_null(),
            (Self::Varchar(builder), Value::Null) => builder.append_null(),
            (Self::Double(builder), Value::Null) => builder.append_null(),
            (Self::Integer(builder), Value::Null) => builder.append_null(),
            (Self::Binary(builder), Value::Null) => builder.append_null(),
            (Self::Boolean(builder), Value::Integer(i)) => builder.append_value(*i != 0),
            (Self::Varchar(builder), Value::Text(t)) => builder.append_value(t),
            (Self::Varchar(builder), Value::Integer(i)) => builder.append_value(i.to_string()),
            (Self::Varchar(builder), Value::Real(f)) => builder.append_value(f.to_string()),
            (Self::Double(builder), Value::Real(f)) => builder.append_value(*f),
            (Self::Double(builder), Value::Integer(i)) => builder.append_value(*i as f64),
            (Self::Integer(builder), Value::Integer(i)) => builder.append_value(*i),
            (Self::Binary(builder), Value::Blob(b)) => builder.append_value(b),
            (_, other) => {
                return Err(OverlayError::InvalidArgument(format!(
                    "column {column} cannot stage value {other:?}"
                )));
            }
        }
        Ok(())
    }

    fn finish(self) -> ArrayRef {
        match self {
            Self::Boolean(mut builder) => ArrayBuilder::finish(&mut builder),
            Self::Varchar(mut builder) => ArrayBuilder::finish(&mut builder),
            Self::Double(mut builder) => ArrayBuilder::finish(&mut builder),
            Self::Integer(mut builder) => ArrayBuilder::finish(&mut builder),
            Self::Binary(mut builder) => ArrayBuilder::finish(&mut builder),
        }
    }
}

struct StagingBatchBuilder<'a> {
    schema: SchemaRef,
    columns: &'a [ColumnSpec],
    fids: Int64Builder,
    geometries: BinaryBuilder,
    builders: Vec<StagingArrayBuilder>,
}

impl<'a> StagingBatchBuilder<'a> {
    fn new(schema: SchemaRef, columns: &'a [ColumnSpec], capacity: usize) -> Self {
        Self {
            schema,
            columns,
            fids: Int64Builder::with_capacity(capacity),
            geometries: BinaryBuilder::with_capacity(capacity, 256 * capacity),
            builders: columns
                .iter()
                .map(|col| StagingArrayBuilder::new(col.column_type, capacity))
                .collect(),
        }
    }

    fn push(&mut self, feature: &GpkgFeature) -> Result<()> {
        if feature.properties().len() != self.builders.len() {
            return Err(OverlayError::InvalidArgument(format!(
                "feature {} has {} properties, expected {}",
                feature.id(),
                feature.properties().len(),
                self.builders.len()
            )));
        }

        self.fids.append_value(feature.id());
        self.geometries.append_option(feature.geometry_blob());
        for ((builder, col), value) in self
            .builders
            .iter_mut()
            .zip(self.columns)
            .zip(feature.properties())
        {
            builder.push(&col.name, value)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<RecordBatch> {
        let mut arrays: Vec<ArrayRef> = vec![
            ArrayBuilder::finish(&mut self.fids),
            ArrayBuilder::finish(&mut self.geometries),
        ];
        arrays.extend(self.builders.into_iter().map(StagingArrayBuilder::finish));
        Ok(RecordBatch::try_new(self.schema, arrays)?)
    }
}

fn downcast<'a, T: 'static>(batch: &'a RecordBatch, idx: usize) -> Result<&'a T> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| {
            OverlayError::InvalidArgument(format!(
                "staging column {} has an unexpected type",
                batch.schema().field(idx).name()
            ))
        })
}

fn read_value(batch: &RecordBatch, idx: usize, row: usize) -> Result<Value> {
    let array = batch.column(idx);
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let value = match array.data_type() {
        DataType::Boolean => Value::Integer(downcast::<BooleanArray>(batch, idx)?.value(row) as i64),
        DataType::Utf8 => Value::Text(downcast::<StringArray>(batch, idx)?.value(row).to_string()),
        DataType::Float64 => Value::Real(downcast::<Float64Array>(batch, idx)?.value(row)),
        DataType::Int64 => Value::Integer(downcast::<Int64Array>(batch, idx)?.value(row)),
        DataType::Binary => Value::Blob(downcast::<BinaryArray>(batch, idx)?.value(row).to_vec()),
        other => {
            return Err(OverlayError::InvalidArgument(format!(
                "unsupported staging column type {other}"
            )));
        }
    };
    Ok(value)
}

fn read_batch(batch: &RecordBatch, features: &mut Vec<GpkgFeature>) -> Result<()> {
    let fids = downcast::<Int64Array>(batch, 0)?;
    let geometries = downcast::<BinaryArray>(batch, 1)?;

    for row in 0..batch.num_rows() {
        let geometry = if geometries.is_null(row) {
            None
        } else {
            Some(geometries.value(row).to_vec())
        };
        let properties = (2..batch.num_columns())
            .map(|idx| read_value(batch, idx, row))
            .collect::<Result<Vec<Value>>>()?;
        features.push(GpkgFeature::from_parts(fids.value(row), geometry, properties));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_layer, write_layer};
    use crate::error::OverlayError;
    use crate::geometry::tests::{gpkg_blob, square};
    use crate::gpkg::GpkgFeature;
    use crate::load::LayerData;
    use crate::types::{ColumnSpec, ColumnType, SpatialRefSys};
    use rusqlite::types::Value;
    use wkb::reader::GeometryType;

    fn sample_layer() -> LayerData {
        LayerData {
            layer_name: "myr".to_string(),
            geometry_type: Some(GeometryType::Polygon),
            srs: SpatialRefSys::undefined(25833),
            columns: vec![
                ColumnSpec {
                    name: "myrtype".to_string(),
                    column_type: ColumnType::Integer,
                },
                ColumnSpec {
                    name: "dybde".to_string(),
                    column_type: ColumnType::Double,
                },
                ColumnSpec {
                    name: "kilde".to_string(),
                    column_type: ColumnType::Varchar,
                },
                ColumnSpec {
                    name: "verifisert".to_string(),
                    column_type: ColumnType::Boolean,
                },
            ],
            features: vec![
                GpkgFeature::from_parts(
                    3,
                    Some(gpkg_blob(square(0.0, 0.0, 2.0), 25833)),
                    vec![
                        Value::Integer(1),
                        Value::Real(0.5),
                        Value::Text("felt".to_string()),
                        Value::Integer(1),
                    ],
                ),
                GpkgFeature::from_parts(
                    8,
                    None,
                    vec![Value::Integer(2), Value::Null, Value::Null, Value::Integer(0)],
                ),
            ],
        }
    }

    #[test]
    fn staged_layer_reads_back_unchanged() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("myr.parquet");
        let layer = sample_layer();

        write_layer(&path, &layer)?;
        assert_eq!(read_layer(&path)?, layer);
        Ok(())
    }

    #[test]
    fn loose_sqlite_values_are_converted() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("myr.parquet");
        let mut layer = sample_layer();
        layer.features[1] = GpkgFeature::from_parts(
            8,
            None,
            vec![
                Value::Integer(2),
                Value::Integer(3),
                Value::Integer(40),
                Value::Null,
            ],
        );

        write_layer(&path, &layer)?;
        let read = read_layer(&path)?;
        assert_eq!(
            read.features[1].properties(),
            &[
                Value::Integer(2),
                Value::Real(3.0),
                Value::Text("40".to_string()),
                Value::Null
            ]
        );
        Ok(())
    }

    #[test]
    fn mismatched_value_is_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut layer = sample_layer();
        layer.features[0] = GpkgFeature::from_parts(
            3,
            None,
            vec![
                Value::Text("x".to_string()),
                Value::Null,
                Value::Null,
                Value::Null,
            ],
        );

        let err = write_layer(dir.path().join("bad.parquet"), &layer).expect_err("text in integer column");
        assert!(matches!(err, OverlayError::InvalidArgument(_)));
        Ok(())
    }

    #[test]
    fn missing_file_is_reported() {
        let err = read_layer("/nonexistent/myr.parquet").expect_err("missing file");
        assert!(matches!(err, OverlayError::MissingFile { .. }));
    }
}
