//! Per-column casts for raw ERP values.
//!
//! A single bad value never fails a sync: anything that does not parse under
//! its declared cast falls back to its trimmed string form.

use crate::model::{Cast, CellValue};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

pub fn cast_value(cast: Cast, raw: &Value) -> CellValue {
    if raw.is_null() || cast.is_binary() {
        return CellValue::Null;
    }
    match cast {
        Cast::Text => CellValue::Text(as_text(raw).trim_end().to_string()),
        Cast::Integer => cast_integer(raw),
        Cast::Numeric => cast_numeric(raw),
        Cast::Boolean => cast_boolean(raw),
        Cast::Date => cast_date(raw),
        Cast::Timestamp => cast_timestamp(raw),
        Cast::Json => cast_json(raw),
        Cast::Blob | Cast::Binary | Cast::Image | Cast::Varbinary => CellValue::Null,
    }
}

fn as_text(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn fallback(raw: &Value) -> CellValue {
    CellValue::Text(as_text(raw).trim().to_string())
}

fn cast_integer(raw: &Value) -> CellValue {
    match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                CellValue::Int(i)
            } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0 && f.is_finite()) {
                CellValue::Int(f as i64)
            } else {
                fallback(raw)
            }
        }
        Value::Bool(b) => CellValue::Int(i64::from(*b)),
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return CellValue::Null;
            }
            if let Ok(i) = t.parse::<i64>() {
                return CellValue::Int(i);
            }
            match t.parse::<f64>() {
                Ok(f) if f.is_finite() && f.fract() == 0.0 => CellValue::Int(f as i64),
                _ => fallback(raw),
            }
        }
        _ => fallback(raw),
    }
}

fn cast_numeric(raw: &Value) -> CellValue {
    match raw {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() => CellValue::Real(f),
            _ => fallback(raw),
        },
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return CellValue::Null;
            }
            // Decimal comma without a dot: "12,5".
            let normalized = if t.contains(',') && !t.contains('.') {
                t.replace(',', ".")
            } else {
                t.to_string()
            };
            match normalized.parse::<f64>() {
                Ok(f) if f.is_finite() => CellValue::Real(f),
                _ => fallback(raw),
            }
        }
        _ => fallback(raw),
    }
}

fn cast_boolean(raw: &Value) -> CellValue {
    match raw {
        Value::Bool(b) => CellValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => CellValue::Bool(false),
            Some(1) => CellValue::Bool(true),
            _ => fallback(raw),
        },
        Value::String(s) => {
            let t = s.trim().to_ascii_lowercase();
            match t.as_str() {
                "" => CellValue::Null,
                "t" | "true" | "s" | "sim" | "y" | "yes" | "1" => CellValue::Bool(true),
                "f" | "false" | "n" | "nao" | "não" | "no" | "0" => CellValue::Bool(false),
                _ => fallback(raw),
            }
        }
        _ => fallback(raw),
    }
}

fn cast_date(raw: &Value) -> CellValue {
    let Value::String(s) = raw else {
        return fallback(raw);
    };
    let t = s.trim();
    if t.is_empty() {
        return CellValue::Null;
    }
    let head = t.get(..10).unwrap_or(t);
    let parsed = NaiveDate::parse_from_str(t, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(head, "%d/%m/%Y"));
    match parsed {
        Ok(date) => CellValue::Text(date.format("%Y-%m-%d").to_string()),
        Err(_) => fallback(raw),
    }
}

fn cast_timestamp(raw: &Value) -> CellValue {
    let Value::String(s) = raw else {
        return fallback(raw);
    };
    let t = s.trim();
    if t.is_empty() {
        return CellValue::Null;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return CellValue::Text(dt.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string());
    }
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y%m%d %H:%M:%S"];
    for fmt in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(t, fmt) {
            return CellValue::Text(dt.format("%Y-%m-%dT%H:%M:%S").to_string());
        }
    }
    fallback(raw)
}

fn cast_json(raw: &Value) -> CellValue {
    match raw {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(v) => CellValue::Text(v.to_string()),
            Err(_) => CellValue::Text(s.clone()),
        },
        other => CellValue::Text(other.to_string()),
    }
}
