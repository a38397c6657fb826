//! `{{placeholder}}` templates for URLs, headers and JSON bodies.
//!
//! Templates are compiled once when the plan is loaded so syntax errors and
//! undeclared bindings surface before the run starts. Rendering never fails:
//! an unset binding renders empty.

use std::collections::BTreeMap;

use rand::Rng;
use serde_json::{Map, Number, Value};

use crate::correlation::CorrelationStore;
use crate::error::ConfigError;

/// Per-render view over the owning virtual user's state.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub vu: u64,
    pub iteration: u64,
    pub repetition: u32,
    pub store: &'a CorrelationStore,
    pub vars: &'a BTreeMap<String, Value>,
}

impl<'a> RenderContext<'a> {
    fn lookup(&self, name: &str) -> Option<&'a Value> {
        self.store.get(name).or_else(|| self.vars.get(name))
    }
}

/// Largest magnitude an f64 holds as an exact integer (2^53).
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;
const MAX_DECIMALS: f64 = 15.0;
const MAX_DIGITS: f64 = 64.0;

fn is_exact_int(v: f64) -> bool {
    v.is_finite() && v.fract() == 0.0 && v.abs() <= MAX_EXACT_INT
}

#[derive(Debug, Clone, PartialEq)]
enum Generator {
    Uuid,
    Timestamp,
    RandInt(i64, i64),
    RandFloat(f64, f64, u32),
    RandDigits(usize),
    Pick(Vec<String>),
}

impl Generator {
    fn parse(source: &str, expr: &str) -> Result<Self, ConfigError> {
        let (name, args) = match expr.find('(') {
            Some(open) => {
                let Some(inner) = expr[open + 1..].strip_suffix(')') else {
                    return Err(ConfigError::template(source, format!("unbalanced `{expr}`")));
                };
                (&expr[..open], Some(inner))
            }
            None => (expr, None),
        };
        let bad_args = || ConfigError::template(source, format!("bad arguments in `{expr}`"));
        let numbers = |args: Option<&str>| -> Result<Vec<f64>, ConfigError> {
            args.unwrap_or_default()
                .split(',')
                .map(|a| a.trim().parse::<f64>().map_err(|_| bad_args()))
                .collect()
        };

        match name.trim() {
            "$uuid" => Ok(Generator::Uuid),
            "$timestamp" => Ok(Generator::Timestamp),
            "$randInt" => match numbers(args)?.as_slice() {
                [min, max] if is_exact_int(*min) && is_exact_int(*max) && min <= max => {
                    Ok(Generator::RandInt(*min as i64, *max as i64))
                }
                _ => Err(bad_args()),
            },
            "$randFloat" => match numbers(args)?.as_slice() {
                [min, max, decimals]
                    if min <= max
                        && (max - min).is_finite()
                        && (0.0..=MAX_DECIMALS).contains(decimals)
                        && decimals.fract() == 0.0 =>
                {
                    Ok(Generator::RandFloat(*min, *max, *decimals as u32))
                }
                _ => Err(bad_args()),
            },
            "$randDigits" => match numbers(args)?.as_slice() {
                [n] if (1.0..=MAX_DIGITS).contains(n) && n.fract() == 0.0 => {
                    Ok(Generator::RandDigits(*n as usize))
                }
                _ => Err(bad_args()),
            },
            "$pick" => {
                let choices: Vec<String> = args
                    .unwrap_or_default()
                    .split('|')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
                if choices.is_empty() {
                    return Err(bad_args());
                }
                Ok(Generator::Pick(choices))
            }
            other => Err(ConfigError::template(
                source,
                format!("unknown generator `{other}`"),
            )),
        }
    }

    fn generate(&self) -> Value {
        let mut rng = rand::thread_rng();
        match self {
            Generator::Uuid => Value::String(uuid::Uuid::new_v4().to_string()),
            Generator::Timestamp => Value::from(chrono::Utc::now().timestamp_millis()),
            Generator::RandInt(min, max) => Value::from(rng.gen_range(*min..=*max)),
            Generator::RandFloat(min, max, decimals) => {
                let raw = if max > min { rng.gen_range(*min..*max) } else { *min };
                let scale = 10f64.powi(*decimals as i32);
                Number::from_f64((raw * scale).round() / scale)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
            Generator::RandDigits(n) => Value::String(
                (0..*n)
                    .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                    .collect(),
            ),
            Generator::Pick(choices) => {
                Value::String(choices[rng.gen_range(0..choices.len())].clone())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Binding {
        name: String,
        fallback: Option<String>,
    },
    Vu,
    Iteration,
    Repetition,
    Generator(Generator),
}

impl Expr {
    fn parse(source: &str, inner: &str) -> Result<Self, ConfigError> {
        let inner = inner.trim();
        if inner.is_empty() {
            return Err(ConfigError::template(source, "empty placeholder"));
        }
        if inner.starts_with('$') {
            return Generator::parse(source, inner).map(Expr::Generator);
        }
        let (name, fallback) = match inner.split_once('|') {
            Some((name, fallback)) => (name.trim(), Some(fallback.trim().to_string())),
            None => (inner, None),
        };
        match name {
            "__VU" => return Ok(Expr::Vu),
            "__ITER" => return Ok(Expr::Iteration),
            "__REP" => return Ok(Expr::Repetition),
            _ => {}
        }
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        if !valid {
            return Err(ConfigError::template(
                source,
                format!("invalid binding name `{name}`"),
            ));
        }
        Ok(Expr::Binding {
            name: name.to_string(),
            fallback,
        })
    }

    fn evaluate(&self, ctx: &RenderContext<'_>) -> Value {
        match self {
            Expr::Binding { name, fallback } => match ctx.lookup(name) {
                Some(value) => value.clone(),
                None => fallback.clone().map(Value::String).unwrap_or(Value::Null),
            },
            Expr::Vu => Value::from(ctx.vu),
            Expr::Iteration => Value::from(ctx.iteration),
            Expr::Repetition => Value::from(ctx.repetition),
            Expr::Generator(generator) => generator.generate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr(Expr),
}

/// A compiled string template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

/// Binding referenced by a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingRef<'a> {
    pub name: &'a str,
    pub has_fallback: bool,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                return Err(ConfigError::template(source, "unclosed `{{`"));
            };
            segments.push(Segment::Expr(Expr::parse(source, &after[..close])?));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn bindings(&self) -> impl Iterator<Item = BindingRef<'_>> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Expr(Expr::Binding { name, fallback }) => Some(BindingRef {
                name,
                has_fallback: fallback.is_some(),
            }),
            _ => None,
        })
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => push_value(&mut out, &expr.evaluate(ctx)),
            }
        }
        out
    }

    /// Renders keeping the JSON type when the template is a single
    /// placeholder; otherwise renders to a string.
    pub fn render_value(&self, ctx: &RenderContext<'_>) -> Value {
        match self.segments.as_slice() {
            [Segment::Expr(expr)] => expr.evaluate(ctx),
            _ => Value::String(self.render(ctx)),
        }
    }
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

/// A JSON document whose string leaves are templates.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonTemplate {
    Literal(Value),
    Text(Template),
    Array(Vec<JsonTemplate>),
    Object(Vec<(String, JsonTemplate)>),
}

impl JsonTemplate {
    pub fn compile(value: &Value) -> Result<Self, ConfigError> {
        Ok(match value {
            Value::String(s) if s.contains("{{") => JsonTemplate::Text(Template::compile(s)?),
            Value::Array(items) => JsonTemplate::Array(
                items
                    .iter()
                    .map(JsonTemplate::compile)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => JsonTemplate::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), JsonTemplate::compile(v)?)))
                    .collect::<Result<_, ConfigError>>()?,
            ),
            other => JsonTemplate::Literal(other.clone()),
        })
    }

    pub fn templates(&self) -> Vec<&Template> {
        let mut out = Vec::new();
        self.collect_templates(&mut out);
        out
    }

    fn collect_templates<'a>(&'a self, out: &mut Vec<&'a Template>) {
        match self {
            JsonTemplate::Literal(_) => {}
            JsonTemplate::Text(t) => out.push(t),
            JsonTemplate::Array(items) => items.iter().for_each(|i| i.collect_templates(out)),
            JsonTemplate::Object(fields) => {
                fields.iter().for_each(|(_, v)| v.collect_templates(out))
            }
        }
    }

    pub fn render(&self, ctx: &RenderContext<'_>) -> Value {
        match self {
            JsonTemplate::Literal(v) => v.clone(),
            JsonTemplate::Text(t) => t.render_value(ctx),
            JsonTemplate::Array(items) => {
                Value::Array(items.iter().map(|i| i.render(ctx)).collect())
            }
            JsonTemplate::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.render(ctx)))
                    .collect::<Map<_, _>>(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(store: &'a CorrelationStore, vars: &'a BTreeMap<String, Value>) -> RenderContext<'a> {
        RenderContext {
            vu: 7,
            iteration: 3,
            repetition: 2,
            store,
            vars,
        }
    }

    #[test]
    fn renders_bindings_builtins_and_literals() {
        let mut store = CorrelationStore::new();
        store.bind("walletId", json!(42));
        let vars = BTreeMap::from([("host".to_string(), json!("broker"))]);

        let t = Template::compile("/wallets/{{ walletId }}?vu={{__VU}}&it={{__ITER}}&h={{host}}")
            .unwrap();
        assert_eq!(t.render(&ctx(&store, &vars)), "/wallets/42?vu=7&it=3&h=broker");
    }

    #[test]
    fn unset_binding_renders_empty_and_fallback_applies() {
        let store = CorrelationStore::new();
        let vars = BTreeMap::new();
        let t = Template::compile("Bearer {{authToken}}").unwrap();
        assert_eq!(t.render(&ctx(&store, &vars)), "Bearer ");

        let t = Template::compile("{{region|eu-west}}").unwrap();
        assert_eq!(t.render(&ctx(&store, &vars)), "eu-west");
        assert!(t.bindings().all(|b| b.has_fallback));
    }

    #[test]
    fn single_placeholder_keeps_json_type() {
        let mut store = CorrelationStore::new();
        store.bind("accountId", json!(1001));
        let vars = BTreeMap::new();
        let body = JsonTemplate::compile(&json!({
            "accountId": "{{accountId}}",
            "label": "acct-{{accountId}}",
            "otp": "{{otp}}",
            "fixed": true
        }))
        .unwrap();
        assert_eq!(
            body.render(&ctx(&store, &vars)),
            json!({ "accountId": 1001, "label": "acct-1001", "otp": null, "fixed": true })
        );
    }

    #[test]
    fn generators_produce_values_in_range() {
        let store = CorrelationStore::new();
        let vars = BTreeMap::new();
        let c = ctx(&store, &vars);

        let qty = Template::compile("{{$randInt(1,3)}}").unwrap();
        for _ in 0..50 {
            let v = qty.render_value(&c).as_i64().unwrap();
            assert!((1..=3).contains(&v));
        }

        let price = Template::compile("{{$randFloat(100,300,2)}}").unwrap();
        let p = price.render_value(&c).as_f64().unwrap();
        assert!((100.0..=300.0).contains(&p));

        let phone = Template::compile("555{{$randDigits(7)}}").unwrap();
        let rendered = phone.render(&c);
        assert_eq!(rendered.len(), 10);
        assert!(rendered.chars().all(|ch| ch.is_ascii_digit()));

        let symbol = Template::compile("{{$pick(AAPL|GOOGL|MSFT)}}").unwrap();
        assert!(["AAPL", "GOOGL", "MSFT"].contains(&symbol.render(&c).as_str()));

        let id = Template::compile("{{$uuid}}").unwrap();
        assert_eq!(id.render(&c).len(), 36);
    }

    #[test]
    fn syntax_errors_are_config_errors() {
        assert!(Template::compile("{{unclosed").is_err());
        assert!(Template::compile("{{  }}").is_err());
        assert!(Template::compile("{{$nope}}").is_err());
        assert!(Template::compile("{{$randInt(5,1)}}").is_err());
        assert!(Template::compile("{{bad name}}").is_err());
    }

    #[test]
    fn random_generators_reject_unsampleable_bounds() {
        assert!(Template::compile("{{$randFloat(-1e308,1e308,2)}}").is_err());
        assert!(Template::compile("{{$randFloat(0,inf,2)}}").is_err());
        assert!(Template::compile("{{$randFloat(0,1,40)}}").is_err());
        assert!(Template::compile("{{$randFloat(0,1,1.5)}}").is_err());
        assert!(Template::compile("{{$randInt(0,1e30)}}").is_err());
        assert!(Template::compile("{{$randInt(-1e19,0)}}").is_err());
        assert!(Template::compile("{{$randInt(NaN,1)}}").is_err());
        assert!(Template::compile("{{$randDigits(1e30)}}").is_err());

        let store = CorrelationStore::new();
        let vars = BTreeMap::new();
        let c = ctx(&store, &vars);
        let wide = Template::compile("{{$randFloat(-1e300,1e300,2)}}").unwrap();
        assert!(wide.render_value(&c).is_number());
        let big = Template::compile("{{$randInt(-9007199254740992,9007199254740992)}}").unwrap();
        assert!(big.render_value(&c).is_i64());
    }

    #[test]
    fn lists_referenced_bindings() {
        let body = JsonTemplate::compile(&json!({
            "tempToken": "{{tempToken}}",
            "otpCode": "{{mfaOtp}}",
            "nested": ["{{__VU}}", "{{email}}"]
        }))
        .unwrap();
        let mut names: Vec<_> = body
            .templates()
            .into_iter()
            .flat_map(|t| t.bindings().map(|b| b.name.to_string()).collect::<Vec<_>>())
            .collect();
        names.sort();
        assert_eq!(names, vec!["email", "mfaOtp", "tempToken"]);
    }
}
