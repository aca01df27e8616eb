//! 工具调用规范化：把正文里的标签式函数调用转成 ToolCall
//!
//! 部分本地模型不走原生 tool_calls，而是在正文中输出：
//!
//! ```text
//! <tool_call>
//! <function=remember>
//! <parameter=fact>
//! User likes pizza
//! </parameter>
//! </function>
//! </tool_call>
//! ```
//!
//! 每个块生成一个新 id 的 ToolCall，参数按工具声明的 schema 做类型转换（integer / number /
//! boolean / object / array），未声明或转换失败则保留原始字符串。匹配到的标记从正文中移除。
//! 不完整或格式错误的标记当作普通文本保留，只记 warn，永不报错。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::llm::ToolDeclaration;
use crate::tools::ToolCall;

fn function_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?s)(?:<tool_call>\s*)?<function=([^>\s]+)\s*>(.*?)</function>(?:\s*</tool_call>)?",
        )
        .expect("function block regex")
    })
}

fn parameter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<parameter=([^>\s]+)\s*>(.*?)</parameter>").expect("parameter regex")
    })
}

/// 参数值：去掉标签后紧跟的一个换行与结束标签前的一个换行，其余原样保留
fn trim_value(raw: &str) -> &str {
    let v = raw.strip_prefix("\r\n").or_else(|| raw.strip_prefix('\n')).unwrap_or(raw);
    v.strip_suffix("\r\n").or_else(|| v.strip_suffix('\n')).unwrap_or(v)
}

/// 按声明的 JSON 类型转换原始字符串
fn coerce(raw: &str, declared: Option<&str>) -> Value {
    let trimmed = raw.trim();
    let coerced = match declared {
        Some("integer") => trimmed.parse::<i64>().ok().map(Value::from),
        Some("number") => trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        Some("boolean") => match trimmed.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        Some("object") | Some("array") => serde_json::from_str::<Value>(trimmed)
            .ok()
            .filter(|v| v.is_object() || v.is_array()),
        _ => None,
    };
    coerced.unwrap_or_else(|| Value::String(raw.to_string()))
}

/// 从 tool 声明里取出 参数名 -> JSON 类型
fn parameter_types(decl: &ToolDeclaration) -> HashMap<String, String> {
    decl.parameters
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| {
            props
                .iter()
                .filter_map(|(name, schema)| {
                    schema
                        .get("type")
                        .and_then(|t| t.as_str())
                        .map(|t| (name.clone(), t.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// 标签式调用解析器；持有各工具参数的类型声明用于转换
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    schemas: HashMap<String, HashMap<String, String>>,
}

impl Normalizer {
    pub fn new(declarations: &[ToolDeclaration]) -> Self {
        Self {
            schemas: declarations
                .iter()
                .map(|d| (d.name.clone(), parameter_types(d)))
                .collect(),
        }
    }

    /// 返回 (去掉标记后的正文, 提取出的调用)；无匹配时原样返回
    pub fn normalize(&self, raw: &str) -> (String, Vec<ToolCall>) {
        let re = function_block_re();
        if !re.is_match(raw) {
            if raw.contains("<function=") {
                tracing::warn!("Incomplete <function=...> markup left as plain text");
            }
            return (raw.to_string(), Vec::new());
        }

        let mut calls = Vec::new();
        let mut cleaned = String::with_capacity(raw.len());
        let mut last = 0;
        for caps in re.captures_iter(raw) {
            let (Some(whole), Some(name), Some(body)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };
            let types = self.schemas.get(name.as_str());
            let mut arguments = Map::new();
            let mut parsed = 0;
            for p in parameter_re().captures_iter(body.as_str()) {
                let (Some(key), Some(value)) = (p.get(1), p.get(2)) else {
                    continue;
                };
                parsed += 1;
                let declared = types.and_then(|t| t.get(key.as_str())).map(String::as_str);
                arguments.insert(key.as_str().to_string(), coerce(trim_value(value.as_str()), declared));
            }
            // 每个 <parameter= 都必须闭合，否则整块按正文保留
            if body.as_str().matches("<parameter=").count() != parsed {
                tracing::warn!(tool = name.as_str(), "Malformed <parameter=...> markup left as plain text");
                continue;
            }

            cleaned.push_str(&raw[last..whole.start()]);
            last = whole.end();

            let call = ToolCall::new(name.as_str(), arguments);
            tracing::info!(tool = %call.name, id = %call.id, "Recovered tag-delimited tool call");
            calls.push(call);
        }
        if calls.is_empty() {
            return (raw.to_string(), calls);
        }
        cleaned.push_str(&raw[last..]);

        if cleaned.contains("<function=") {
            tracing::warn!("Unterminated <function=...> markup left as plain text");
        }

        (tidy(&cleaned), calls)
    }
}

/// 移除标记后整理空行：去首尾空白，连续 3 个以上换行压成 2 个
fn tidy(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for ch in text.trim().chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines > 2 {
                continue;
            }
        } else {
            newlines = 0;
        }
        out.push(ch);
    }
    out
}

/// 不带 schema 的规范化：所有参数保持字符串
pub fn normalize(raw: &str) -> (String, Vec<ToolCall>) {
    Normalizer::default().normalize(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(name: &str, parameters: Value) -> ToolDeclaration {
        ToolDeclaration {
            name: name.to_string(),
            description: String::new(),
            parameters,
        }
    }

    #[test]
    fn test_plain_text_is_unchanged() {
        let text = "Hello!  Nothing to see here.\n\n\n\nReally.";
        let (cleaned, calls) = normalize(text);
        assert_eq!(cleaned, text);
        assert!(calls.is_empty());
    }

    #[test]
    fn test_round_trip_preserves_arguments() {
        let raw = "<function=N>\n<parameter=a>\n1\n</parameter>\n<parameter=b>\nx\n</parameter>\n</function>";
        let (cleaned, calls) = normalize(raw);
        assert_eq!(cleaned, "");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "N");
        assert_eq!(Value::Object(calls[0].arguments.clone()), json!({"a": "1", "b": "x"}));
    }

    #[test]
    fn test_markup_removed_from_prose() {
        let raw = "Sure, noting that.\n<tool_call>\n<function=remember>\n<parameter=fact>\nUser likes pizza\n</parameter>\n</function>\n</tool_call>\nDone!";
        let (cleaned, calls) = normalize(raw);
        assert_eq!(cleaned, "Sure, noting that.\n\nDone!");
        assert_eq!(calls[0].arguments["fact"], json!("User likes pizza"));
    }

    #[test]
    fn test_unclosed_parameter_stays_text() {
        let raw = "Sure <function=remember><parameter=fact>pizza</function> ok";
        let (cleaned, calls) = normalize(raw);
        assert_eq!(cleaned, raw);
        assert!(calls.is_empty());
    }

    #[test]
    fn test_malformed_block_does_not_swallow_valid_one() {
        let raw = "<function=a><parameter=x>1</function> then <function=b><parameter=k>v</parameter></function>";
        let (cleaned, calls) = normalize(raw);
        assert_eq!(cleaned, "<function=a><parameter=x>1</function> then");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "b");
    }

    #[test]
    fn test_multiple_blocks_get_distinct_ids() {
        let raw = "<function=a></function> and <function=b><parameter=k>v</parameter></function>";
        let (cleaned, calls) = normalize(raw);
        assert_eq!(cleaned, "and");
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].id, calls[1].id);
        assert_eq!(calls[1].arguments["k"], json!("v"));
    }

    #[test]
    fn test_schema_coercion() {
        let normalizer = Normalizer::new(&[decl(
            "search",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer"},
                    "score": {"type": "number"},
                    "exact": {"type": "boolean"},
                    "filters": {"type": "object"}
                }
            }),
        )]);
        let raw = "<function=search><parameter=query>42</parameter><parameter=limit> 5 </parameter><parameter=score>0.5</parameter><parameter=exact>TRUE</parameter><parameter=filters>{\"lang\":\"en\"}</parameter></function>";
        let (_, calls) = normalizer.normalize(raw);
        let args = &calls[0].arguments;
        assert_eq!(args["query"], json!("42"));
        assert_eq!(args["limit"], json!(5));
        assert_eq!(args["score"], json!(0.5));
        assert_eq!(args["exact"], json!(true));
        assert_eq!(args["filters"], json!({"lang": "en"}));
    }

    #[test]
    fn test_failed_coercion_keeps_string() {
        let normalizer = Normalizer::new(&[decl(
            "search",
            json!({"properties": {"limit": {"type": "integer"}}}),
        )]);
        let (_, calls) = normalizer.normalize("<function=search><parameter=limit>many</parameter></function>");
        assert_eq!(calls[0].arguments["limit"], json!("many"));
    }

    #[test]
    fn test_unterminated_markup_is_prose() {
        let raw = "I will call <function=remember><parameter=fact>pizza";
        let (cleaned, calls) = normalize(raw);
        assert_eq!(cleaned, raw);
        assert!(calls.is_empty());
    }
}
