//! 操作分类器：把一条用户消息归为 READ / WRITE / GENERAL
//!
//! 纯函数、确定性、不会失败。两张有序触发短语表，大小写不敏感匹配规范化后的输入；
//! 两张表同时命中时按 [`Precedence`] 决定，默认 WRITE 优先。

use serde::{Deserialize, Serialize};

/// 操作类别，每轮计算一次后不再改变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationCategory {
    Read,
    Write,
    General,
}

impl std::fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OperationCategory::Read => "READ",
            OperationCategory::Write => "WRITE",
            OperationCategory::General => "GENERAL",
        })
    }
}

/// 同时命中 READ 与 WRITE 时的裁决
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    #[default]
    WriteFirst,
    ReadFirst,
}

/// 写入类触发短语（记忆写入、偏好声明）
const WRITE_TRIGGERS: &[&str] = &[
    "remember that",
    "remember this",
    "remember my",
    "remember i",
    "remember:",
    "please remember",
    "don't forget",
    "do not forget",
    "make a note",
    "note that",
    "keep in mind",
    "save this",
    "store this",
    "my name is",
    "call me ",
    "from now on",
    "forget that",
    "i prefer",
    "update my",
    "记住",
    "别忘了",
    "记一下",
    "帮我记",
];

/// 读取类触发短语（回忆、查询、读文件）
const READ_TRIGGERS: &[&str] = &[
    "what's my",
    "what is my",
    "what are my",
    "what do i",
    "what did i",
    "what have i",
    "who am i",
    "do you remember",
    "do you know my",
    "do you know what i",
    "recall",
    "remind me",
    "tell me what i",
    "look up",
    "search for",
    "read the file",
    "read file",
    "open the file",
    "list the files",
    "我叫什么",
    "我喜欢什么",
    "还记得",
    "查一下",
    "读取文件",
];

/// 规范化：去首尾空白、小写、弯引号转直引号、连续空白压成一个空格
pub fn normalize_input(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .replace(['\u{2019}', '\u{2018}'], "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// 分类器：触发表 + 裁决策略
#[derive(Debug, Clone)]
pub struct OperationClassifier {
    write_triggers: Vec<String>,
    read_triggers: Vec<String>,
    precedence: Precedence,
}

impl Default for OperationClassifier {
    fn default() -> Self {
        Self::new(Precedence::default())
    }
}

impl OperationClassifier {
    pub fn new(precedence: Precedence) -> Self {
        Self {
            write_triggers: WRITE_TRIGGERS.iter().map(|s| s.to_string()).collect(),
            read_triggers: READ_TRIGGERS.iter().map(|s| s.to_string()).collect(),
            precedence,
        }
    }

    /// 追加自定义触发短语（配置扩展用），统一按规范化形式保存
    pub fn with_extra_triggers(mut self, write: &[String], read: &[String]) -> Self {
        self.write_triggers
            .extend(write.iter().map(|s| normalize_input(s)).filter(|s| !s.is_empty()));
        self.read_triggers
            .extend(read.iter().map(|s| normalize_input(s)).filter(|s| !s.is_empty()));
        self
    }

    pub fn precedence(&self) -> Precedence {
        self.precedence
    }

    pub fn classify(&self, text: &str) -> OperationCategory {
        // 输入末尾补空格，让 "call me " 这类带尾空格的短语也能匹配句末
        let input = format!("{} ", normalize_input(text));
        let is_write = self.write_triggers.iter().any(|t| input.contains(t.as_str()));
        let is_read = self.read_triggers.iter().any(|t| input.contains(t.as_str()));
        match (is_write, is_read, self.precedence) {
            (true, true, Precedence::WriteFirst) => OperationCategory::Write,
            (true, true, Precedence::ReadFirst) => OperationCategory::Read,
            (true, false, _) => OperationCategory::Write,
            (false, true, _) => OperationCategory::Read,
            (false, false, _) => OperationCategory::General,
        }
    }
}

/// 使用默认触发表与 WRITE 优先策略分类
pub fn classify(text: &str) -> OperationCategory {
    OperationClassifier::default().classify(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_read() {
        assert_eq!(classify("What's my name?"), OperationCategory::Read);
        assert_eq!(classify("What do I like?"), OperationCategory::Read);
        assert_eq!(classify("  DO YOU REMEMBER where I live "), OperationCategory::Read);
        assert_eq!(classify("What\u{2019}s my favourite color"), OperationCategory::Read);
    }

    #[test]
    fn test_classify_write() {
        assert_eq!(classify("Remember that I like pizza"), OperationCategory::Write);
        assert_eq!(classify("my name is Ada"), OperationCategory::Write);
        assert_eq!(classify("记住：我喜欢吃辣"), OperationCategory::Write);
        assert_eq!(classify("You can call me Bob"), OperationCategory::Write);
    }

    #[test]
    fn test_classify_general() {
        assert_eq!(classify("Tell me a joke"), OperationCategory::General);
        assert_eq!(classify(""), OperationCategory::General);
        assert_eq!(classify("   \n\t "), OperationCategory::General);
    }

    #[test]
    fn test_write_wins_when_both_match() {
        let text = "Do you remember my dog? Remember that his name is Rex";
        assert_eq!(classify(text), OperationCategory::Write);
    }

    #[test]
    fn test_read_first_policy() {
        let classifier = OperationClassifier::new(Precedence::ReadFirst);
        let text = "Do you remember my dog? Remember that his name is Rex";
        assert_eq!(classifier.classify(text), OperationCategory::Read);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let inputs = ["What's my name?", "Remember that I like pizza", "hello", "记住 x", ""];
        for input in inputs {
            let first = classify(input);
            for _ in 0..10 {
                assert_eq!(classify(input), first);
            }
        }
    }

    #[test]
    fn test_extra_triggers() {
        let classifier = OperationClassifier::default()
            .with_extra_triggers(&["Jot Down".to_string()], &["  ".to_string()]);
        assert_eq!(classifier.classify("jot down my plate number"), OperationCategory::Write);
    }
}
