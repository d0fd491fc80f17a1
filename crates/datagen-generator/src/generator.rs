use chrono::{Duration, Utc};
use datagen_core::types::{FieldSpec, Row};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};

use crate::error::{GenerateError, Result};

/// Produces `count` records for the given field list.
///
/// Implementations must be pure apart from their randomness source: no I/O,
/// no shared mutable state. The scheduler calls this from a blocking worker
/// thread, so it may be CPU-heavy.
pub trait DataGenerator: Send + Sync {
    fn generate(&self, fields: &[FieldSpec], count: u32) -> Result<Vec<Row>>;
}

const SURNAMES: &[&str] = &[
    "王", "李", "张", "刘", "陈", "杨", "黄", "赵", "周", "吴", "徐", "孙", "马", "胡", "朱",
];
const GIVEN_NAMES: &[&str] = &[
    "伟", "芳", "娜", "敏", "静", "丽", "强", "磊", "军", "洋", "勇", "艳", "杰", "涛", "明",
];
const FIRST_NAMES: &[&str] = &[
    "James", "John", "Robert", "Michael", "David", "Mary", "Patricia", "Jennifer", "Linda",
    "Elizabeth",
];
const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez",
    "Martinez",
];
const PROVINCES: &[&str] = &[
    "北京市", "上海市", "广东省", "江苏省", "浙江省", "山东省", "四川省", "湖北省",
];
const CITIES: &[&str] = &[
    "北京", "上海", "广州", "深圳", "杭州", "南京", "成都", "武汉", "西安", "重庆",
];
const COMPANY_PREFIXES: &[&str] = &["华", "中", "东", "新", "创", "智", "云", "数", "信", "恒"];
const COMPANY_SUFFIXES: &[&str] = &[
    "科技有限公司",
    "网络科技有限公司",
    "信息技术有限公司",
    "数据服务有限公司",
];
const JOB_TITLES: &[&str] = &[
    "Senior Engineer",
    "Product Manager",
    "Project Manager",
    "Data Analyst",
    "QA Engineer",
    "UI Designer",
    "Sales Manager",
];
const GENDERS: &[&str] = &["male", "female"];
const WORDS: &[&str] = &[
    "test", "data", "system", "platform", "service", "manage", "build", "product", "project",
];
const SENTENCES: &[&str] = &[
    "This is sample data generated for testing.",
    "The system is processing the request.",
    "The record was saved successfully.",
    "User profile has been updated.",
    "The order is being processed.",
];
const EMAIL_DOMAINS: &[&str] = &["gmail.com", "163.com", "qq.com", "outlook.com", "company.com"];
const PHONE_PREFIXES: &[&str] = &["138", "139", "150", "151", "158", "186", "187", "188"];
const TLDS: &[&str] = &["com", "net", "org", "io"];
const HOSTS: &[&str] = &["example", "test", "demo", "sample"];
const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random generator covering the platform's built-in field types.
#[derive(Debug, Default, Clone)]
pub struct BuiltinGenerator;

impl BuiltinGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Every field type name this generator understands.
    pub fn supported_types() -> &'static [&'static str] {
        &[
            "uuid", "chineseName", "englishName", "email", "phone", "chinesePhone", "age",
            "gender", "number", "string", "boolean", "date", "datetime", "timestamp", "province",
            "city", "zipcode", "url", "ip", "ipv6", "mac", "domain", "company", "jobTitle",
            "word", "sentence", "paragraph", "amount", "enum", "constant",
        ]
    }

    fn value<R: Rng>(&self, field: &FieldSpec, rng: &mut R) -> Result<Value> {
        let value = match field.field_type.as_str() {
            "uuid" => json!(uuid::Uuid::new_v4().to_string()),
            "chineseName" => json!(format!("{}{}", pick(SURNAMES, rng), pick(GIVEN_NAMES, rng))),
            "englishName" => json!(format!("{} {}", pick(FIRST_NAMES, rng), pick(LAST_NAMES, rng))),
            "email" => json!(format!(
                "{}@{}",
                random_token(rng, 8),
                pick(EMAIL_DOMAINS, rng)
            )),
            "chinesePhone" => json!(format!(
                "{}{}",
                pick(PHONE_PREFIXES, rng),
                rng.gen_range(10_000_000..=99_999_999)
            )),
            "phone" => json!(format!(
                "+1 {}-{}-{}",
                rng.gen_range(200..=999),
                rng.gen_range(100..=999),
                rng.gen_range(1000..=9999)
            )),
            "age" => json!(int_in_range(field, rng, 18, 65)?),
            "number" => json!(int_in_range(field, rng, 1, 100_000)?),
            "gender" => json!(pick(GENDERS, rng)),
            "string" => json!(random_token(rng, 10)),
            "boolean" => json!(rng.gen_bool(0.5)),
            "date" => json!(format!(
                "{}-{:02}-{:02}",
                rng.gen_range(2020..=2024),
                rng.gen_range(1..=12),
                rng.gen_range(1..=28)
            )),
            "datetime" => json!(format!(
                "{}-{:02}-{:02} {:02}:{:02}:{:02}",
                rng.gen_range(2020..=2024),
                rng.gen_range(1..=12),
                rng.gen_range(1..=28),
                rng.gen_range(0..=23),
                rng.gen_range(0..=59),
                rng.gen_range(0..=59)
            )),
            "timestamp" => {
                let at = Utc::now() - Duration::days(rng.gen_range(0..=365));
                json!(at.timestamp_millis().to_string())
            }
            "province" => json!(pick(PROVINCES, rng)),
            "city" => json!(pick(CITIES, rng)),
            "zipcode" => json!(rng.gen_range(100_000..=999_999).to_string()),
            "url" => json!(format!(
                "https://{}.{}/{}",
                pick(HOSTS, rng),
                pick(TLDS, rng),
                pick(&["api", "user", "data"], rng)
            )),
            "domain" => json!(format!("{}.{}", pick(HOSTS, rng), pick(TLDS, rng))),
            "ip" => json!(format!(
                "{}.{}.{}.{}",
                rng.gen_range(1..=255),
                rng.gen_range(0..=255),
                rng.gen_range(0..=255),
                rng.gen_range(1..=254)
            )),
            "ipv6" => {
                let groups: Vec<String> = (0..8)
                    .map(|_| format!("{:04x}", rng.gen_range(0..=0xffffu32)))
                    .collect();
                json!(groups.join(":"))
            }
            "mac" => {
                let octets: Vec<String> = (0..6)
                    .map(|_| format!("{:02X}", rng.gen_range(0..=255u32)))
                    .collect();
                json!(octets.join(":"))
            }
            "company" => json!(format!(
                "{}{}{}",
                pick(COMPANY_PREFIXES, rng),
                pick(COMPANY_PREFIXES, rng),
                pick(COMPANY_SUFFIXES, rng)
            )),
            "jobTitle" => json!(pick(JOB_TITLES, rng)),
            "word" => json!(pick(WORDS, rng)),
            "sentence" => json!(pick(SENTENCES, rng)),
            "paragraph" => {
                let n = rng.gen_range(3..=5);
                let parts: Vec<&str> = (0..n).map(|_| pick(SENTENCES, rng)).collect();
                json!(parts.join(" "))
            }
            "amount" => json!(format!(
                "{:.2}",
                rng.gen_range(100.0..100_000.0f64)
            )),
            "enum" => {
                let values = field
                    .options
                    .get("values")
                    .and_then(Value::as_array)
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| GenerateError::InvalidOptions {
                        field: field.name.clone(),
                        reason: "enum needs a non-empty options.values array".to_string(),
                    })?;
                values
                    .choose(rng)
                    .cloned()
                    .unwrap_or(Value::Null)
            }
            "constant" => field
                .options
                .get("value")
                .cloned()
                .ok_or_else(|| GenerateError::InvalidOptions {
                    field: field.name.clone(),
                    reason: "constant needs options.value".to_string(),
                })?,
            other => {
                return Err(GenerateError::UnsupportedType {
                    field: field.name.clone(),
                    field_type: other.to_string(),
                })
            }
        };
        Ok(value)
    }
}

impl DataGenerator for BuiltinGenerator {
    fn generate(&self, fields: &[FieldSpec], count: u32) -> Result<Vec<Row>> {
        tracing::debug!(fields = fields.len(), count, "generating batch");
        let mut rng = rand::thread_rng();
        let mut rows = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut row = Row::new();
            for field in fields {
                row.insert(field.name.clone(), self.value(field, &mut rng)?);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

fn pick<'a, R: Rng>(items: &[&'a str], rng: &mut R) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

fn random_token<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| LOWER_ALNUM[rng.gen_range(0..LOWER_ALNUM.len())] as char)
        .collect()
}

/// Integer in `[options.min, options.max]`, falling back to the type defaults.
fn int_in_range<R: Rng>(field: &FieldSpec, rng: &mut R, min: i64, max: i64) -> Result<i64> {
    let lo = field.options.get("min").and_then(Value::as_i64).unwrap_or(min);
    let hi = field.options.get("max").and_then(Value::as_i64).unwrap_or(max);
    if lo > hi {
        return Err(GenerateError::InvalidOptions {
            field: field.name.clone(),
            reason: format!("min ({lo}) is greater than max ({hi})"),
        });
    }
    Ok(rng.gen_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_count_in_field_order() {
        let fields = vec![
            FieldSpec::new("id", "uuid"),
            FieldSpec::new("name", "englishName"),
            FieldSpec::new("active", "boolean"),
        ];
        let rows = BuiltinGenerator::new().generate(&fields, 10).unwrap();
        assert_eq!(rows.len(), 10);
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, ["id", "name", "active"]);
        assert!(rows[0]["active"].is_boolean());
    }

    #[test]
    fn number_honours_min_and_max() {
        let fields = vec![FieldSpec::new("n", "number").with_options(json!({"min": 5, "max": 7}))];
        let rows = BuiltinGenerator::new().generate(&fields, 50).unwrap();
        for row in rows {
            let n = row["n"].as_i64().unwrap();
            assert!((5..=7).contains(&n));
        }
    }

    #[test]
    fn inverted_range_is_an_error() {
        let fields = vec![FieldSpec::new("n", "age").with_options(json!({"min": 9, "max": 1}))];
        let err = BuiltinGenerator::new().generate(&fields, 1).unwrap_err();
        assert!(matches!(err, GenerateError::InvalidOptions { .. }));
    }

    #[test]
    fn enum_picks_from_values() {
        let fields =
            vec![FieldSpec::new("tier", "enum").with_options(json!({"values": ["gold", "silver"]}))];
        let rows = BuiltinGenerator::new().generate(&fields, 20).unwrap();
        for row in rows {
            let tier = row["tier"].as_str().unwrap();
            assert!(tier == "gold" || tier == "silver");
        }
    }

    #[test]
    fn unknown_type_fails_generation() {
        let fields = vec![FieldSpec::new("x", "quantumFlux")];
        let err = BuiltinGenerator::new().generate(&fields, 1).unwrap_err();
        assert!(err.to_string().contains("quantumFlux"));
    }

    #[test]
    fn zero_rows_is_empty() {
        let fields = vec![FieldSpec::new("id", "uuid")];
        assert!(BuiltinGenerator::new().generate(&fields, 0).unwrap().is_empty());
    }

    #[test]
    fn every_listed_type_generates() {
        let fields: Vec<FieldSpec> = BuiltinGenerator::supported_types()
            .iter()
            .map(|t| match *t {
                "enum" => FieldSpec::new(t, t).with_options(json!({"values": [1, 2]})),
                "constant" => FieldSpec::new(t, t).with_options(json!({"value": "x"})),
                _ => FieldSpec::new(t, t),
            })
            .collect();
        let rows = BuiltinGenerator::new().generate(&fields, 3).unwrap();
        assert_eq!(rows[0].len(), fields.len());
    }
}
