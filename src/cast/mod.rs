//! Value conversion shared by foreground dual writes and backfill.
//!
//! Both paths call the same [`TypeCoercion`] so a row converted by the
//! background rewrite and a row written during the transition end up with
//! identical shadow values.

pub mod temporal;

use crate::catalog::schema::ColumnDef;
use crate::catalog::types::{ColumnType, Datum, TypeClass};
use crate::config::SqlMode;
use crate::error::ShiftError;
use compact_str::CompactString;
use std::collections::HashMap;

/// How an existing column can move to a new definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeChange {
    /// Stored values stay valid; only metadata changes.
    MetadataOnly,
    /// Every row must be converted into a shadow column.
    Rewrite,
    Reject(String),
}

/// A conversion failure, or under relaxed mode a loss reported as a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastError {
    Truncated,
    OutOfRange,
    WrongValue { type_name: &'static str, value: String },
    TooLong,
}

impl CastError {
    /// Attaches the column and row the failing value belongs to.
    pub fn into_shift_error(self, column: &str, row: i64) -> ShiftError {
        let column = column.to_string();
        match self {
            CastError::Truncated => ShiftError::DataTruncated { column, row },
            CastError::OutOfRange => ShiftError::DataOutOfRange { column, row },
            CastError::WrongValue { type_name, value } => ShiftError::TruncatedWrongValue {
                type_name: type_name.to_string(),
                value,
                column,
                row,
            },
            CastError::TooLong => ShiftError::DataTooLong { column, row },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CastOutcome {
    pub value: Datum,
    pub warning: Option<CastError>,
}

impl CastOutcome {
    fn exact(value: Datum) -> Self {
        Self {
            value,
            warning: None,
        }
    }

    fn lossy(value: Datum, warning: CastError) -> Self {
        Self {
            value,
            warning: Some(warning),
        }
    }
}

/// The type system's conversion routine.
pub trait TypeCoercion: Send + Sync {
    fn check_change(&self, from: &ColumnDef, to: &ColumnDef) -> TypeChange;

    /// Converts `value`, stored under `from`, into a value for column `to`.
    fn cast(
        &self,
        value: &Datum,
        from: &ColumnType,
        to: &ColumnDef,
        mode: SqlMode,
    ) -> Result<CastOutcome, CastError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastRule {
    Allowed,
    Rejected,
}

/// Which type classes may be converted into which.
#[derive(Debug, Clone)]
pub struct CastMatrix {
    rules: HashMap<(TypeClass, TypeClass), CastRule>,
}

impl Default for CastMatrix {
    fn default() -> Self {
        let mut matrix = Self {
            rules: HashMap::new(),
        };
        for from in [
            TypeClass::String,
            TypeClass::Binary,
            TypeClass::Real,
            TypeClass::Json,
            TypeClass::Temporal,
            TypeClass::Year,
        ] {
            matrix.rules.insert((from, TypeClass::Bit), CastRule::Rejected);
        }
        matrix
            .rules
            .insert((TypeClass::Binary, TypeClass::Json), CastRule::Rejected);
        matrix
            .rules
            .insert((TypeClass::Bit, TypeClass::Temporal), CastRule::Rejected);
        matrix
    }
}

impl CastMatrix {
    pub fn with_rule(mut self, from: TypeClass, to: TypeClass, rule: CastRule) -> Self {
        self.rules.insert((from, to), rule);
        self
    }

    pub fn rule(&self, from: TypeClass, to: TypeClass) -> CastRule {
        self.rules
            .get(&(from, to))
            .copied()
            .unwrap_or(CastRule::Allowed)
    }
}

/// Default conversion rules, modelled on MySQL-compatible casting.
#[derive(Debug, Clone, Default)]
pub struct SqlCoercion {
    matrix: CastMatrix,
}

impl SqlCoercion {
    pub fn new(matrix: CastMatrix) -> Self {
        Self { matrix }
    }
}

impl TypeCoercion for SqlCoercion {
    fn check_change(&self, from: &ColumnDef, to: &ColumnDef) -> TypeChange {
        let (src, dst) = (&from.col_type, &to.col_type);
        if self.matrix.rule(src.class(), dst.class()) == CastRule::Rejected {
            return TypeChange::Reject(format!("type {src} cannot be changed to {dst}"));
        }
        if from.nullable && !to.nullable {
            return TypeChange::Rewrite;
        }
        if values_stay_valid(src, dst) {
            TypeChange::MetadataOnly
        } else {
            TypeChange::Rewrite
        }
    }

    fn cast(
        &self,
        value: &Datum,
        from: &ColumnType,
        to: &ColumnDef,
        mode: SqlMode,
    ) -> Result<CastOutcome, CastError> {
        if value.is_null() {
            if to.nullable {
                return Ok(CastOutcome::exact(Datum::Null));
            }
            return lossy_or_fail(mode, to.col_type.zero_value(), CastError::Truncated);
        }
        let target = &to.col_type;
        match target.class() {
            TypeClass::Integer | TypeClass::Bit => to_integer(value, from, target, mode),
            TypeClass::Real => to_real(value, from, target, mode),
            TypeClass::String => to_text(value, from, target, mode),
            TypeClass::Binary => to_binary(value, from),
            TypeClass::Json => to_json(value, from),
            TypeClass::Temporal => to_temporal(value, target, mode),
            TypeClass::Year => to_year(value, mode),
        }
    }
}

fn values_stay_valid(src: &ColumnType, dst: &ColumnType) -> bool {
    if src == dst {
        return true;
    }
    match (src, dst) {
        (ColumnType::Bit { width: a }, ColumnType::Bit { width: b }) => b >= a,
        (ColumnType::Varchar { max_len: a }, ColumnType::Varchar { max_len: b }) => b >= a,
        (ColumnType::Varchar { .. }, ColumnType::Text) => true,
        (ColumnType::Float, ColumnType::Double) => true,
        _ if src.is_integer() && dst.is_integer() => {
            src.is_unsigned() == dst.is_unsigned() && dst.int_width() >= src.int_width()
        }
        _ => false,
    }
}

fn lossy_or_fail(mode: SqlMode, value: Datum, err: CastError) -> Result<CastOutcome, CastError> {
    match mode {
        SqlMode::Strict => Err(err),
        SqlMode::Relaxed => Ok(CastOutcome::lossy(value, err)),
    }
}

fn wrong_value(target: &ColumnType, value: impl Into<String>) -> CastError {
    CastError::WrongValue {
        type_name: target.value_kind(),
        value: value.into(),
    }
}

/// MySQL rounds half away from zero when converting reals to integers.
fn round_to_int(f: f64) -> i128 {
    let rounded = f.round();
    if rounded >= i128::MAX as f64 {
        i128::MAX
    } else if rounded <= i128::MIN as f64 {
        i128::MIN
    } else {
        rounded as i128
    }
}

fn parse_integer_text(text: &str, target: &ColumnType) -> Result<i128, CastError> {
    let trimmed = text.trim();
    if let Ok(v) = trimmed.parse::<i128>() {
        return Ok(v);
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(round_to_int(f)),
        _ => Err(wrong_value(target, text)),
    }
}

/// Numeric value of a JSON document. Only numbers and booleans convert.
fn json_number(text: &str, target: &ColumnType) -> Result<f64, CastError> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Bool(b)) => Ok(if b { 1.0 } else { 0.0 }),
        Ok(serde_json::Value::Number(n)) => n.as_f64().ok_or_else(|| wrong_value(target, text)),
        _ => Err(wrong_value(target, text)),
    }
}

fn json_integer(text: &str, target: &ColumnType) -> Result<i128, CastError> {
    if let Ok(serde_json::Value::Number(n)) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(v) = n.as_i64() {
            return Ok(i128::from(v));
        }
        if let Some(v) = n.as_u64() {
            return Ok(i128::from(v));
        }
    }
    json_number(text, target).map(round_to_int)
}

fn to_integer(
    value: &Datum,
    from: &ColumnType,
    target: &ColumnType,
    mode: SqlMode,
) -> Result<CastOutcome, CastError> {
    let n: i128 = match value {
        Datum::Int(v) => i128::from(*v),
        Datum::UInt(v) => i128::from(*v),
        Datum::Float(f) if f.is_finite() => round_to_int(*f),
        Datum::Float(_) => return Err(CastError::OutOfRange),
        Datum::Text(s) => parse_integer_text(s, target)?,
        Datum::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => parse_integer_text(s, target)?,
            Err(_) => return Err(wrong_value(target, String::from_utf8_lossy(b))),
        },
        Datum::Json(s) => json_integer(s, target)?,
        Datum::Time(t) => i128::from(temporal::to_number(from, *t).ok_or(CastError::OutOfRange)?),
        Datum::Null => return Err(CastError::Truncated),
    };
    let Some((lo, hi)) = target.int_bounds() else {
        return Err(wrong_value(target, value.to_string()));
    };
    let make = |v: i128| {
        if target.is_unsigned() {
            Datum::UInt(v as u64)
        } else {
            Datum::Int(v as i64)
        }
    };
    if n < lo {
        return lossy_or_fail(mode, make(lo), CastError::OutOfRange);
    }
    if n > hi {
        return lossy_or_fail(mode, make(hi), CastError::OutOfRange);
    }
    Ok(CastOutcome::exact(make(n)))
}

fn to_real(
    value: &Datum,
    from: &ColumnType,
    target: &ColumnType,
    mode: SqlMode,
) -> Result<CastOutcome, CastError> {
    let f = match value {
        Datum::Int(v) => *v as f64,
        Datum::UInt(v) => *v as f64,
        Datum::Float(f) => *f,
        Datum::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| wrong_value(target, s.as_str()))?,
        Datum::Bytes(b) => String::from_utf8_lossy(b)
            .trim()
            .parse::<f64>()
            .map_err(|_| wrong_value(target, String::from_utf8_lossy(b)))?,
        Datum::Json(s) => json_number(s, target)?,
        Datum::Time(t) => temporal::to_number(from, *t).ok_or(CastError::OutOfRange)? as f64,
        Datum::Null => return Err(CastError::Truncated),
    };
    if !f.is_finite() {
        return Err(CastError::OutOfRange);
    }
    if matches!(target, ColumnType::Float) {
        let limit = f64::from(f32::MAX);
        if f.abs() > limit {
            return lossy_or_fail(mode, Datum::Float(limit.copysign(f)), CastError::OutOfRange);
        }
        return Ok(CastOutcome::exact(Datum::Float(f64::from(f as f32))));
    }
    Ok(CastOutcome::exact(Datum::Float(f)))
}

fn bit_bytes(v: u64, width: u8) -> Vec<u8> {
    let len = usize::from(width.clamp(1, 64)).div_ceil(8);
    v.to_be_bytes()[8 - len..].to_vec()
}

fn render_text(value: &Datum, from: &ColumnType, target: &ColumnType) -> Result<String, CastError> {
    Ok(match (value, from) {
        (Datum::UInt(v), ColumnType::Bit { width }) => {
            let bytes = bit_bytes(*v, *width);
            String::from_utf8(bytes).map_err(|e| {
                let hex: String = e.as_bytes().iter().map(|b| format!("\\x{b:02X}")).collect();
                wrong_value(target, hex)
            })?
        }
        (Datum::Bytes(b), _) => String::from_utf8(b.clone()).map_err(|e| {
            let hex: String = e.as_bytes().iter().map(|b| format!("\\x{b:02X}")).collect();
            wrong_value(target, hex)
        })?,
        (Datum::Time(t), _) => temporal::format_for(from, *t),
        (other, _) => other.to_string(),
    })
}

fn to_text(
    value: &Datum,
    from: &ColumnType,
    target: &ColumnType,
    mode: SqlMode,
) -> Result<CastOutcome, CastError> {
    let text = render_text(value, from, target)?;
    if let ColumnType::Varchar { max_len } = target {
        let max_len = *max_len as usize;
        if text.chars().count() > max_len {
            let cut: String = text.chars().take(max_len).collect();
            return lossy_or_fail(mode, Datum::Text(cut.into()), CastError::TooLong);
        }
    }
    Ok(CastOutcome::exact(Datum::Text(CompactString::from(text))))
}

fn to_binary(value: &Datum, from: &ColumnType) -> Result<CastOutcome, CastError> {
    let bytes = match (value, from) {
        (Datum::UInt(v), ColumnType::Bit { width }) => bit_bytes(*v, *width),
        (Datum::Bytes(b), _) => b.clone(),
        (Datum::Time(t), _) => temporal::format_for(from, *t).into_bytes(),
        (other, _) => other.to_string().into_bytes(),
    };
    Ok(CastOutcome::exact(Datum::Bytes(bytes)))
}

fn to_json(value: &Datum, from: &ColumnType) -> Result<CastOutcome, CastError> {
    let target = ColumnType::Json;
    let doc = match value {
        Datum::Json(s) => s.to_string(),
        Datum::Text(s) => {
            serde_json::from_str::<serde_json::Value>(s).map_err(|_| wrong_value(&target, s.as_str()))?;
            s.to_string()
        }
        Datum::Bytes(b) => {
            let s = std::str::from_utf8(b).map_err(|_| wrong_value(&target, String::from_utf8_lossy(b)))?;
            serde_json::from_str::<serde_json::Value>(s).map_err(|_| wrong_value(&target, s))?;
            s.to_string()
        }
        Datum::Int(v) => v.to_string(),
        Datum::UInt(v) => v.to_string(),
        Datum::Float(f) => serde_json::Number::from_f64(*f)
            .map(|n| n.to_string())
            .ok_or_else(|| wrong_value(&target, f.to_string()))?,
        Datum::Time(t) => serde_json::Value::String(temporal::format_for(from, *t)).to_string(),
        Datum::Null => "null".to_string(),
    };
    Ok(CastOutcome::exact(Datum::Json(doc.into())))
}

fn to_temporal(value: &Datum, target: &ColumnType, mode: SqlMode) -> Result<CastOutcome, CastError> {
    let micros = match value {
        // Unsigned integers are never read as dates.
        Datum::UInt(v) => return Err(wrong_value(target, v.to_string())),
        Datum::Int(v) => temporal::from_number(*v).ok_or_else(|| wrong_value(target, v.to_string()))?,
        Datum::Float(f) if f.fract() == 0.0 && f.is_finite() => temporal::from_number(*f as i64)
            .ok_or_else(|| wrong_value(target, f.to_string()))?,
        Datum::Float(f) => return Err(wrong_value(target, f.to_string())),
        Datum::Text(s) => temporal::parse(s).ok_or_else(|| wrong_value(target, s.as_str()))?,
        Datum::Bytes(b) => {
            let s = String::from_utf8_lossy(b);
            temporal::parse(&s).ok_or_else(|| wrong_value(target, s.as_ref()))?
        }
        Datum::Json(s) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(serde_json::Value::String(inner)) => {
                temporal::parse(&inner).ok_or_else(|| wrong_value(target, s.as_str()))?
            }
            _ => return Err(wrong_value(target, s.as_str())),
        },
        Datum::Time(t) => *t,
        Datum::Null => return Err(CastError::Truncated),
    };
    let micros = if matches!(target, ColumnType::Date) {
        temporal::truncate_to_day(micros)
    } else {
        micros
    };
    if matches!(target, ColumnType::Timestamp) && !temporal::timestamp_in_range(micros) {
        return lossy_or_fail(mode, Datum::Time(0), CastError::OutOfRange);
    }
    Ok(CastOutcome::exact(Datum::Time(micros)))
}

fn to_year(value: &Datum, mode: SqlMode) -> Result<CastOutcome, CastError> {
    let target = ColumnType::Year;
    let n: i128 = match value {
        Datum::Int(v) => i128::from(*v),
        Datum::UInt(v) => i128::from(*v),
        Datum::Float(f) if f.is_finite() => round_to_int(*f),
        Datum::Text(s) => parse_integer_text(s, &target)?,
        Datum::Time(t) => i128::from(temporal::year_of(*t).ok_or(CastError::OutOfRange)?),
        Datum::Json(s) => json_integer(s, &target)?,
        other => return Err(wrong_value(&target, other.to_string())),
    };
    let year = match n {
        0 => 0,
        1..=69 => 2000 + n,
        70..=99 => 1900 + n,
        1901..=2155 => n,
        _ => return lossy_or_fail(mode, Datum::Int(0), CastError::OutOfRange),
    };
    Ok(CastOutcome::exact(Datum::Int(year as i64)))
}

/// Converts a client-supplied literal into a value for `to`.
pub fn coerce_literal(
    coercion: &dyn TypeCoercion,
    value: &Datum,
    to: &ColumnDef,
    mode: SqlMode,
) -> Result<CastOutcome, CastError> {
    let from = ColumnType::natural_for(value);
    coercion.cast(value, &from, to, mode)
}

#[cfg(test)]
mod tests {
    use super::{CastError, CastMatrix, CastRule, SqlCoercion, TypeChange, TypeCoercion, coerce_literal};
    use crate::catalog::schema::{ColumnDef, SchemaState};
    use crate::catalog::types::{ColumnType, Datum, TypeClass};
    use crate::config::SqlMode;
    use proptest::prelude::*;

    fn col(name: &str, col_type: ColumnType, nullable: bool) -> ColumnDef {
        ColumnDef {
            id: 1,
            name: name.into(),
            offset: 0,
            col_type,
            nullable,
            default: None,
            origin_default: None,
            prevent_null_insert: false,
            state: SchemaState::Public,
            changing_from: None,
        }
    }

    fn cast(value: Datum, from: ColumnType, to: ColumnType, mode: SqlMode) -> Result<Datum, CastError> {
        SqlCoercion::default()
            .cast(&value, &from, &col("a", to, true), mode)
            .map(|o| o.value)
    }

    #[test]
    fn widening_integers_is_metadata_only() {
        let c = SqlCoercion::default();
        let tiny = col("a", ColumnType::tinyint(), true);
        let small = col("a", ColumnType::SmallInt { unsigned: false }, true);
        let tiny_unsigned = col("a", ColumnType::TinyInt { unsigned: true }, true);
        assert_eq!(c.check_change(&tiny, &small), TypeChange::MetadataOnly);
        assert_eq!(c.check_change(&small, &tiny), TypeChange::Rewrite);
        assert_eq!(c.check_change(&tiny, &tiny_unsigned), TypeChange::Rewrite);
        let not_null = col("a", ColumnType::tinyint(), false);
        assert_eq!(c.check_change(&tiny, &not_null), TypeChange::Rewrite);
        assert_eq!(c.check_change(&not_null, &tiny), TypeChange::MetadataOnly);
    }

    #[test]
    fn matrix_rejections_are_configurable() {
        let text = col("a", ColumnType::Text, true);
        let bit = col("a", ColumnType::Bit { width: 8 }, true);
        assert!(matches!(
            SqlCoercion::default().check_change(&text, &bit),
            TypeChange::Reject(_)
        ));
        let permissive = SqlCoercion::new(
            CastMatrix::default().with_rule(TypeClass::String, TypeClass::Bit, CastRule::Allowed),
        );
        assert_eq!(permissive.check_change(&text, &bit), TypeChange::Rewrite);
    }

    #[test]
    fn narrowing_overflow_depends_on_mode() {
        let big = Datum::Int(i64::MAX);
        assert_eq!(
            cast(big.clone(), ColumnType::bigint(), ColumnType::int(), SqlMode::Strict),
            Err(CastError::OutOfRange)
        );
        let relaxed = SqlCoercion::default()
            .cast(&big, &ColumnType::bigint(), &col("a", ColumnType::int(), true), SqlMode::Relaxed)
            .expect("relaxed clamps");
        assert_eq!(relaxed.value, Datum::Int(i64::from(i32::MAX)));
        assert_eq!(relaxed.warning, Some(CastError::OutOfRange));
    }

    #[test]
    fn null_into_not_null_is_truncation() {
        let c = SqlCoercion::default();
        let target = col("a", ColumnType::int(), false);
        let err = c
            .cast(&Datum::Null, &ColumnType::int(), &target, SqlMode::Strict)
            .expect_err("strict");
        assert_eq!(
            err.into_shift_error("a", 1).to_string(),
            "Data truncated for column 'a' at row 1"
        );
        let relaxed = c
            .cast(&Datum::Null, &ColumnType::int(), &target, SqlMode::Relaxed)
            .expect("relaxed");
        assert_eq!(relaxed.value, Datum::Int(0));
    }

    #[test]
    fn json_to_integer_follows_document_kind() {
        let to_tiny = |doc: &str| cast(Datum::json(doc), ColumnType::Json, ColumnType::tinyint(), SqlMode::Strict);
        assert_eq!(to_tiny("true"), Ok(Datum::Int(1)));
        assert_eq!(to_tiny("false"), Ok(Datum::Int(0)));
        assert_eq!(to_tiny("-22"), Ok(Datum::Int(-22)));
        assert_eq!(to_tiny("1.5"), Ok(Datum::Int(2)));
        assert_eq!(to_tiny("1000"), Err(CastError::OutOfRange));
        for doc in ["{\"obj\": 100}", "[-1, 0, 1]", "null", "\"str\""] {
            assert_eq!(
                to_tiny(doc),
                Err(CastError::WrongValue {
                    type_name: "integer",
                    value: doc.to_string()
                }),
                "{doc}"
            );
        }
        let msg = to_tiny("{\"k\":1}")
            .expect_err("object")
            .into_shift_error("a", 1)
            .to_string();
        assert_eq!(msg, "Incorrect integer value: '{\"k\":1}' for column 'a' at row 1");
    }

    #[test]
    fn string_to_number_parse_failure_is_always_an_error() {
        for mode in [SqlMode::Strict, SqlMode::Relaxed] {
            assert!(matches!(
                cast(Datum::text("abc"), ColumnType::Text, ColumnType::int(), mode),
                Err(CastError::WrongValue { .. })
            ));
        }
        assert_eq!(
            cast(Datum::text(" 42 "), ColumnType::Text, ColumnType::int(), SqlMode::Strict),
            Ok(Datum::Int(42))
        );
    }

    #[test]
    fn integers_into_datetime() {
        let dt = cast(Datum::Int(20200102), ColumnType::int(), ColumnType::Datetime, SqlMode::Strict)
            .expect("valid date number");
        assert_eq!(dt.to_string(), "2020-01-02 00:00:00");
        assert!(matches!(
            cast(Datum::Int(0), ColumnType::int(), ColumnType::Datetime, SqlMode::Strict),
            Err(CastError::WrongValue { type_name: "datetime", .. })
        ));
        assert!(matches!(
            cast(Datum::UInt(20200102), ColumnType::Int { unsigned: true }, ColumnType::Datetime, SqlMode::Strict),
            Err(CastError::WrongValue { .. })
        ));
    }

    #[test]
    fn bit_to_string_requires_valid_utf8() {
        let ok = cast(Datum::UInt(0x61), ColumnType::Bit { width: 8 }, ColumnType::Text, SqlMode::Strict);
        assert_eq!(ok, Ok(Datum::text("a")));
        let bad = cast(Datum::UInt(0xFF), ColumnType::Bit { width: 8 }, ColumnType::Text, SqlMode::Strict);
        assert!(matches!(bad, Err(CastError::WrongValue { type_name: "string", .. })));
    }

    #[test]
    fn varchar_length_is_enforced() {
        let to = ColumnType::varchar(3);
        assert_eq!(
            cast(Datum::text("abcd"), ColumnType::Text, to, SqlMode::Strict),
            Err(CastError::TooLong)
        );
        assert_eq!(
            cast(Datum::text("abcd"), ColumnType::Text, to, SqlMode::Relaxed),
            Ok(Datum::text("abc"))
        );
        assert_eq!(
            cast(Datum::Int(-7), ColumnType::int(), to, SqlMode::Strict),
            Ok(Datum::text("-7"))
        );
    }

    #[test]
    fn literals_use_their_natural_type() {
        let target = col("a", ColumnType::Date, true);
        let out = coerce_literal(&SqlCoercion::default(), &Datum::text("2021-03-04 10:00:00"), &target, SqlMode::Strict)
            .expect("date literal");
        assert_eq!(out.value.to_string(), "2021-03-04 00:00:00");
    }

    proptest! {
        #[test]
        fn widening_preserves_integer_values(v in any::<i8>()) {
            let widened = cast(Datum::Int(i64::from(v)), ColumnType::tinyint(), ColumnType::bigint(), SqlMode::Strict);
            prop_assert_eq!(widened, Ok(Datum::Int(i64::from(v))));
        }

        #[test]
        fn strict_narrowing_never_changes_a_value(v in any::<i64>()) {
            match cast(Datum::Int(v), ColumnType::bigint(), ColumnType::SmallInt { unsigned: false }, SqlMode::Strict) {
                Ok(out) => prop_assert_eq!(out, Datum::Int(v)),
                Err(e) => prop_assert_eq!(e, CastError::OutOfRange),
            }
        }
    }
}
