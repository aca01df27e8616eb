//! 工具参数 JSON Schema 生成（schemars 自动生成）
//!
//! 工具参数结构体 derive JsonSchema，声明给后端的 parameters 由此生成，与反序列化用的结构保持一致。

use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde_json::Value;

/// 返回参数结构体 T 的 JSON Schema（去掉 $schema / title 等后端不需要的字段）
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let settings = SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
        s.meta_schema = None;
    });
    let schema = settings.into_generator().into_root_schema_for::<T>();
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("title");
        obj.remove("definitions");
    }
    value
}

/// 把工具 args 反序列化为参数结构体，错误信息可直接返回给模型
pub fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments for {}: {}", tool, e))
}
