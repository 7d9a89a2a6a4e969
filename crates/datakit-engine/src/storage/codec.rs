//! Step-level Arrow encoding of episodes.
//!
//! One row per step. Fixed columns carry flags, timing and the task index;
//! every tensor key (`action` and each tabular observation key) becomes a
//! list column in the tensor's own element type, with a companion
//! `__shape__.<key>` column holding the tensor shape. Rows of steps that
//! lack a key are null.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, BooleanBuilder, Float32Builder, Float64Array,
    Float64Builder, Int32Builder, Int64Builder, ListArray, ListBuilder, StringArray,
    StringBuilder, UInt32Builder, UInt64Array, UInt64Builder, UInt8Builder,
};
use arrow::datatypes::{DataType, Float32Type, Float64Type, Int32Type, Int64Type, UInt64Type, UInt8Type};
use arrow::record_batch::RecordBatch;
use datakit_types::episode::{Episode, Step};
use datakit_types::tensor::{DType, Tensor, TensorData};

use super::parquet::column;

pub const INDEX_COLUMN: &str = "index";
pub const EPISODE_ID_COLUMN: &str = "episode_id";
pub const FRAME_INDEX_COLUMN: &str = "frame_index";
pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const IS_FIRST_COLUMN: &str = "is_first";
pub const IS_LAST_COLUMN: &str = "is_last";
pub const IS_TERMINAL_COLUMN: &str = "is_terminal";
pub const REWARD_COLUMN: &str = "reward";
pub const DISCOUNT_COLUMN: &str = "discount";
pub const TASK_INDEX_COLUMN: &str = "task_index";
pub const STEP_METADATA_COLUMN: &str = "step_metadata";
pub const ACTION_COLUMN: &str = "action";
pub const SHAPE_PREFIX: &str = "__shape__.";

const FIXED_COLUMNS: [&str; 11] = [
    INDEX_COLUMN,
    EPISODE_ID_COLUMN,
    FRAME_INDEX_COLUMN,
    TIMESTAMP_COLUMN,
    IS_FIRST_COLUMN,
    IS_LAST_COLUMN,
    IS_TERMINAL_COLUMN,
    REWARD_COLUMN,
    DISCOUNT_COLUMN,
    TASK_INDEX_COLUMN,
    STEP_METADATA_COLUMN,
];

// ---------------------------------------------------------------------------
// Dtype coercion
// ---------------------------------------------------------------------------

/// Convert tensor elements to `dtype`. Numeric conversions go through
/// `f64`; strings that do not parse become NaN (or zero for integers).
/// The encoder only ever calls this with a dtype widened to hold `data`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn coerce(data: &TensorData, dtype: DType) -> TensorData {
    if data.dtype() == dtype {
        return data.clone();
    }
    let widened: Vec<f64> = match data {
        TensorData::String(v) => {
            if dtype == DType::String {
                return data.clone();
            }
            v.iter().map(|s| s.trim().parse().unwrap_or(f64::NAN)).collect()
        }
        _ => Tensor {
            shape: vec![data.len()],
            data: data.clone(),
        }
        .to_f64_vec()
        .unwrap_or_default(),
    };
    match dtype {
        DType::Bool => TensorData::Bool(widened.iter().map(|v| *v != 0.0).collect()),
        DType::Uint8 => TensorData::Uint8(widened.iter().map(|v| *v as u8).collect()),
        DType::Int32 => TensorData::Int32(widened.iter().map(|v| *v as i32).collect()),
        DType::Int64 => TensorData::Int64(widened.iter().map(|v| *v as i64).collect()),
        DType::Float32 => TensorData::Float32(widened.iter().map(|v| *v as f32).collect()),
        DType::Float64 => TensorData::Float64(widened),
        DType::String => TensorData::String(widened.iter().map(f64::to_string).collect()),
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

enum ListColumn {
    Bool(ListBuilder<BooleanBuilder>),
    Uint8(ListBuilder<UInt8Builder>),
    Int32(ListBuilder<Int32Builder>),
    Int64(ListBuilder<Int64Builder>),
    Float32(ListBuilder<Float32Builder>),
    Float64(ListBuilder<Float64Builder>),
    String(ListBuilder<StringBuilder>),
}

impl ListColumn {
    fn new(dtype: DType) -> Self {
        match dtype {
            DType::Bool => Self::Bool(ListBuilder::new(BooleanBuilder::new())),
            DType::Uint8 => Self::Uint8(ListBuilder::new(UInt8Builder::new())),
            DType::Int32 => Self::Int32(ListBuilder::new(Int32Builder::new())),
            DType::Int64 => Self::Int64(ListBuilder::new(Int64Builder::new())),
            DType::Float32 => Self::Float32(ListBuilder::new(Float32Builder::new())),
            DType::Float64 => Self::Float64(ListBuilder::new(Float64Builder::new())),
            DType::String => Self::String(ListBuilder::new(StringBuilder::new())),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Uint8(_) => DType::Uint8,
            Self::Int32(_) => DType::Int32,
            Self::Int64(_) => DType::Int64,
            Self::Float32(_) => DType::Float32,
            Self::Float64(_) => DType::Float64,
            Self::String(_) => DType::String,
        }
    }

    fn append(&mut self, tensor: Option<&Tensor>) {
        let Some(tensor) = tensor else {
            self.append_null();
            return;
        };
        let data = coerce(&tensor.data, self.dtype());
        match (self, data) {
            (Self::Bool(b), TensorData::Bool(v)) => {
                b.values().append_slice(&v);
                b.append(true);
            }
            (Self::Uint8(b), TensorData::Uint8(v)) => {
                b.values().append_slice(&v);
                b.append(true);
            }
            (Self::Int32(b), TensorData::Int32(v)) => {
                b.values().append_slice(&v);
                b.append(true);
            }
            (Self::Int64(b), TensorData::Int64(v)) => {
                b.values().append_slice(&v);
                b.append(true);
            }
            (Self::Float32(b), TensorData::Float32(v)) => {
                b.values().append_slice(&v);
                b.append(true);
            }
            (Self::Float64(b), TensorData::Float64(v)) => {
                b.values().append_slice(&v);
                b.append(true);
            }
            (Self::String(b), TensorData::String(v)) => {
                for s in &v {
                    b.values().append_value(s);
                }
                b.append(true);
            }
            (column, _) => column.append_null(),
        }
    }

    fn append_null(&mut self) {
        match self {
            Self::Bool(b) => b.append_null(),
            Self::Uint8(b) => b.append_null(),
            Self::Int32(b) => b.append_null(),
            Self::Int64(b) => b.append_null(),
            Self::Float32(b) => b.append_null(),
            Self::Float64(b) => b.append_null(),
            Self::String(b) => b.append_null(),
        }
    }

    fn finish(self) -> ArrayRef {
        match self {
            Self::Bool(mut b) => Arc::new(b.finish()),
            Self::Uint8(mut b) => Arc::new(b.finish()),
            Self::Int32(mut b) => Arc::new(b.finish()),
            Self::Int64(mut b) => Arc::new(b.finish()),
            Self::Float32(mut b) => Arc::new(b.finish()),
            Self::Float64(mut b) => Arc::new(b.finish()),
            Self::String(mut b) => Arc::new(b.finish()),
        }
    }
}

struct TensorColumn {
    values: ListColumn,
    shapes: ListBuilder<UInt64Builder>,
}

impl TensorColumn {
    fn new(dtype: DType) -> Self {
        Self {
            values: ListColumn::new(dtype),
            shapes: ListBuilder::new(UInt64Builder::new()),
        }
    }

    fn append(&mut self, tensor: Option<&Tensor>) {
        self.values.append(tensor);
        match tensor {
            Some(t) => {
                for dim in &t.shape {
                    self.shapes.values().append_value(*dim as u64);
                }
                self.shapes.append(true);
            }
            None => self.shapes.append_null(),
        }
    }
}

fn tensor_of<'a>(step: &'a Step, key: &str) -> Option<&'a Tensor> {
    if key == ACTION_COLUMN {
        step.action.as_ref()
    } else {
        step.observation.get(key)
    }
}

/// Tensor keys of `episodes` in column order, each with the widest dtype
/// any episode of the shard uses for it, so no element is narrowed.
fn tensor_keys(episodes: &[Episode]) -> Vec<(String, DType)> {
    let mut dtypes: BTreeMap<String, DType> = BTreeMap::new();
    let mut action: Option<DType> = None;
    for step in episodes.iter().flat_map(|e| &e.steps) {
        if let Some(tensor) = &step.action {
            action = Some(action.map_or(tensor.dtype(), |d| d.widen(tensor.dtype())));
        }
        for (key, tensor) in &step.observation {
            dtypes
                .entry(key.clone())
                .and_modify(|d| *d = d.widen(tensor.dtype()))
                .or_insert_with(|| tensor.dtype());
        }
    }
    action
        .map(|dtype| (ACTION_COLUMN.to_string(), dtype))
        .into_iter()
        .chain(dtypes)
        .collect()
}

/// Encode the steps of `episodes` as one batch whose `index` column starts
/// at `first_row`.
pub fn encode_steps(episodes: &[Episode], first_row: u64) -> Result<RecordBatch> {
    let rows: usize = episodes.iter().map(Episode::num_steps).sum();
    let mut index = UInt64Builder::with_capacity(rows);
    let mut episode_ids = StringBuilder::new();
    let mut frame_index = UInt64Builder::with_capacity(rows);
    let mut timestamps = Float64Builder::with_capacity(rows);
    let mut is_first = BooleanBuilder::with_capacity(rows);
    let mut is_last = BooleanBuilder::with_capacity(rows);
    let mut is_terminal = BooleanBuilder::with_capacity(rows);
    let mut rewards = Float64Builder::with_capacity(rows);
    let mut discounts = Float64Builder::with_capacity(rows);
    let mut task_index = UInt32Builder::with_capacity(rows);
    let mut step_metadata = StringBuilder::new();

    let keys = tensor_keys(episodes);
    let mut columns: Vec<TensorColumn> = keys.iter().map(|(_, dtype)| TensorColumn::new(*dtype)).collect();

    let mut row = first_row;
    for episode in episodes {
        let task = episode.task_id.unwrap_or(0);
        for (i, step) in episode.steps.iter().enumerate() {
            index.append_value(row);
            row += 1;
            episode_ids.append_value(&episode.episode_id);
            frame_index.append_value(i as u64);
            timestamps.append_value(step.timestamp);
            is_first.append_value(step.is_first);
            is_last.append_value(step.is_last);
            is_terminal.append_value(step.is_terminal);
            rewards.append_option(step.reward);
            discounts.append_option(step.discount);
            task_index.append_value(task);
            if step.step_metadata.is_empty() {
                step_metadata.append_null();
            } else {
                let json = serde_json::to_string(&step.step_metadata)
                    .context("Failed to encode step metadata")?;
                step_metadata.append_value(json);
            }
            for ((key, _), column) in keys.iter().zip(columns.iter_mut()) {
                column.append(tensor_of(step, key));
            }
        }
    }

    let mut arrays: Vec<(String, ArrayRef)> = vec![
        (INDEX_COLUMN.into(), Arc::new(index.finish())),
        (EPISODE_ID_COLUMN.into(), Arc::new(episode_ids.finish())),
        (FRAME_INDEX_COLUMN.into(), Arc::new(frame_index.finish())),
        (TIMESTAMP_COLUMN.into(), Arc::new(timestamps.finish())),
        (IS_FIRST_COLUMN.into(), Arc::new(is_first.finish())),
        (IS_LAST_COLUMN.into(), Arc::new(is_last.finish())),
        (IS_TERMINAL_COLUMN.into(), Arc::new(is_terminal.finish())),
        (REWARD_COLUMN.into(), Arc::new(rewards.finish())),
        (DISCOUNT_COLUMN.into(), Arc::new(discounts.finish())),
        (TASK_INDEX_COLUMN.into(), Arc::new(task_index.finish())),
        (STEP_METADATA_COLUMN.into(), Arc::new(step_metadata.finish())),
    ];
    for ((key, _), mut column) in keys.into_iter().zip(columns) {
        arrays.push((format!("{SHAPE_PREFIX}{key}"), Arc::new(column.shapes.finish())));
        arrays.push((key, column.values.finish()));
    }
    RecordBatch::try_from_iter(arrays).context("Failed to assemble step batch")
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn list_tensor_data(values: &ArrayRef) -> Result<TensorData> {
    let data = match values.data_type() {
        DataType::Boolean => TensorData::Bool(values.as_boolean().iter().map(|v| v.unwrap_or(false)).collect()),
        DataType::UInt8 => TensorData::Uint8(values.as_primitive::<UInt8Type>().values().to_vec()),
        DataType::Int32 => TensorData::Int32(values.as_primitive::<Int32Type>().values().to_vec()),
        DataType::Int64 => TensorData::Int64(values.as_primitive::<Int64Type>().values().to_vec()),
        DataType::Float32 => TensorData::Float32(values.as_primitive::<Float32Type>().values().to_vec()),
        DataType::Float64 => TensorData::Float64(values.as_primitive::<Float64Type>().values().to_vec()),
        DataType::Utf8 => TensorData::String(
            values
                .as_string::<i32>()
                .iter()
                .map(|v| v.unwrap_or_default().to_string())
                .collect(),
        ),
        other => bail!("unsupported tensor element type {other}"),
    };
    Ok(data)
}

struct TensorReader<'a> {
    key: String,
    values: &'a ListArray,
    shapes: Option<&'a ListArray>,
}

impl TensorReader<'_> {
    fn read(&self, row: usize) -> Result<Option<Tensor>> {
        if self.values.is_null(row) {
            return Ok(None);
        }
        let data = list_tensor_data(&self.values.value(row))
            .with_context(|| format!("Failed to decode column '{}'", self.key))?;
        let shape = match self.shapes.filter(|s| !s.is_null(row)) {
            Some(shapes) => shapes
                .value(row)
                .as_primitive::<UInt64Type>()
                .values()
                .iter()
                .map(|d| usize::try_from(*d))
                .collect::<Result<Vec<_>, _>>()
                .context("Shape dimension out of range")?,
            None => vec![data.len()],
        };
        Tensor::new(shape, data)
            .map(Some)
            .with_context(|| format!("Inconsistent shape in column '{}'", self.key))
    }
}

/// Decode rows `range` of `batch` back into steps, checking that every row
/// belongs to `episode_id`.
pub fn decode_steps(batch: &RecordBatch, range: Range<usize>, episode_id: &str) -> Result<Vec<Step>> {
    if range.end > batch.num_rows() {
        bail!(
            "rows {}..{} of episode '{episode_id}' exceed shard length {}",
            range.start,
            range.end,
            batch.num_rows()
        );
    }
    let episode_ids = column::<StringArray>(batch, EPISODE_ID_COLUMN)?;
    let timestamps = column::<Float64Array>(batch, TIMESTAMP_COLUMN)?;
    let is_first = column::<BooleanArray>(batch, IS_FIRST_COLUMN)?;
    let is_last = column::<BooleanArray>(batch, IS_LAST_COLUMN)?;
    let is_terminal = column::<BooleanArray>(batch, IS_TERMINAL_COLUMN)?;
    let rewards = column::<Float64Array>(batch, REWARD_COLUMN)?;
    let discounts = column::<Float64Array>(batch, DISCOUNT_COLUMN)?;
    let step_metadata = column::<StringArray>(batch, STEP_METADATA_COLUMN)?;

    let schema = batch.schema();
    let fixed: BTreeSet<&str> = FIXED_COLUMNS.into_iter().collect();
    let mut tensors = Vec::new();
    for (i, field) in schema.fields().iter().enumerate() {
        let name = field.name();
        if fixed.contains(name.as_str()) || name.starts_with(SHAPE_PREFIX) {
            continue;
        }
        let values = batch
            .column(i)
            .as_list_opt::<i32>()
            .with_context(|| format!("Column '{name}' is not a list column"))?;
        let shapes = batch
            .column_by_name(&format!("{SHAPE_PREFIX}{name}"))
            .and_then(|c| c.as_list_opt::<i32>());
        tensors.push(TensorReader { key: name.clone(), values, shapes });
    }

    let mut steps = Vec::with_capacity(range.len());
    for row in range {
        if episode_ids.value(row) != episode_id {
            bail!(
                "row {row} belongs to episode '{}', expected '{episode_id}'",
                episode_ids.value(row)
            );
        }
        let mut step = Step::new(is_first.value(row), is_last.value(row), timestamps.value(row));
        step.is_terminal = is_terminal.value(row);
        step.reward = (!rewards.is_null(row)).then(|| rewards.value(row));
        step.discount = (!discounts.is_null(row)).then(|| discounts.value(row));
        if !step_metadata.is_null(row) {
            step.step_metadata = serde_json::from_str(step_metadata.value(row))
                .context("Failed to decode step metadata")?;
        }
        for reader in &tensors {
            let Some(tensor) = reader.read(row)? else {
                continue;
            };
            if reader.key == ACTION_COLUMN {
                step.action = Some(tensor);
            } else {
                step.observation.insert(reader.key.clone(), tensor);
            }
        }
        steps.push(step);
    }
    Ok(steps)
}

/// The `index` column of a data shard.
pub fn row_indices(batch: &RecordBatch) -> Result<&UInt64Array> {
    column::<UInt64Array>(batch, INDEX_COLUMN)
}

/// Names of the tensor columns in a data batch.
#[must_use]
pub fn tensor_columns(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .filter(|name| !FIXED_COLUMNS.contains(&name.as_str()) && !name.starts_with(SHAPE_PREFIX))
        .collect()
}
