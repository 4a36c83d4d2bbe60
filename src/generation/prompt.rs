//! Prompt templates.
//!
//! All lengths are counted in characters. Templates are plain `format!`
//! strings; [`fit_prompt`] shrinks the context section when a rendered
//! prompt would exceed `max_prompt_chars`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Answer style requested by the caller. Unknown names fall back to
/// [`ResponseType::General`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Diagnosis,
    Advice,
    Explanation,
    #[default]
    #[serde(other)]
    General,
}

impl ResponseType {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "diagnosis" => Self::Diagnosis,
            "advice" => Self::Advice,
            "explanation" => Self::Explanation,
            _ => Self::General,
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Diagnosis => "diagnosis",
            Self::Advice => "advice",
            Self::Explanation => "explanation",
            Self::General => "general",
        })
    }
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }
}

/// First `max` characters of `s`.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Wrap a digest in the context template, truncated to `max_chars`
/// characters plus `...`. An empty digest yields an empty context.
pub fn build_context(summary: &str, max_chars: usize) -> String {
    let summary = summary.trim();
    if summary.is_empty() {
        return String::new();
    }
    let context = format!(
        "基于以下医学知识摘要，请回答用户的问题：\n\n医学知识摘要：\n{}\n\n请基于以上医学知识，结合您的专业知识，为用户提供准确、专业的回答。",
        summary
    );
    if context.chars().count() > max_chars {
        format!("{}...", truncate_chars(&context, max_chars))
    } else {
        context
    }
}

const GENERAL_FORMAT: &str = "请按照以下专业格式回答：

【症状分析】
- 根据用户描述，分析可能的症状特点
- 结合医学知识，说明症状的可能原因

【专业建议】
- 提供具体的医疗建议和注意事项
- 建议必要的检查或观察要点
- 给出生活调理建议

【就医指导】
- 明确什么情况下需要及时就医
- 建议就诊科室和检查项目
- 提醒紧急情况的处理方式

【注意事项】
- 强调此回答仅供参考，不能替代专业诊断
- 提醒用户及时咨询专业医生

要求：
- 语言专业但易懂，避免过于复杂的医学术语
- 回答要具体实用，不要泛泛而谈
- 基于提供的医学知识进行回答，不要编造信息
- 保持医疗建议的准确性和安全性";

const CAUTIOUS_REQUIREMENTS: &str = "要求：
- 语言温和、专业
- 避免给出具体的诊断或治疗建议
- 重点强调咨询专业医生的重要性
- 保持回答的谨慎性和安全性";

/// Prompt for a question with retrieved context.
pub fn medical_prompt(response_type: ResponseType, question: &str, context: &str) -> String {
    match response_type {
        ResponseType::Diagnosis => format!(
            "作为一位专业的医疗AI助手，请根据以下信息提供诊断建议：\n用户症状描述：{}\n\n相关医学知识：\n{}\n\n请提供：\n1. 可能的疾病诊断\n2. 诊断依据\n3. 建议的检查项目\n4. 注意事项\n\n注意：这仅供参考，不能替代专业医生的诊断。",
            question, context
        ),
        ResponseType::Advice => format!(
            "作为一位专业的医疗AI助手，请根据以下信息提供健康建议：\n\n用户问题：{}\n\n相关医学知识：\n{}\n\n请提供：\n1. 健康建议\n2. 预防措施\n3. 生活方式建议\n4. 何时需要就医\n\n注意：这仅供参考，不能替代专业医生的建议。",
            question, context
        ),
        ResponseType::Explanation => format!(
            "作为一位专业的医疗AI助手，请解释以下医学概念：\n\n用户问题：{}\n\n相关医学知识：\n{}\n\n请提供：\n1. 详细解释\n2. 相关机制\n3. 临床表现\n4. 治疗原则\n\n注意：这仅供参考，不能替代专业医生的解释。",
            question, context
        ),
        ResponseType::General => format!(
            "你是一位专业的医疗AI助手，具有丰富的医学知识和临床经验。请根据用户的问题和提供的医学知识，给出专业、准确、实用的医疗建议。\n\n用户问题：{}\n\n相关医学知识：\n{}\n\n{}",
            question, context, GENERAL_FORMAT
        ),
    }
}

/// Prompt used when retrieval found nothing relevant.
pub fn no_context_prompt(question: &str) -> String {
    format!(
        "你是一位专业的医疗AI助手。用户询问了以下问题，但我在医学知识库中没有找到足够相关的信息来提供准确的医疗建议。

用户问题：{}

请按照以下格式回答：

【问题理解】
- 简要理解用户的问题和关注点

【一般性建议】
- 提供一般性的健康建议和注意事项
- 建议用户关注的相关症状或体征
- 给出基本的生活调理建议

【就医建议】
- 强烈建议用户咨询专业医生
- 建议合适的就诊科室
- 提醒及时就医的重要性

【重要提醒】
- 强调此回答仅供参考，不能替代专业诊断
- 提醒用户及时咨询专业医生获取准确信息
- 如有紧急情况请立即就医

{}",
        question, CAUTIOUS_REQUIREMENTS
    )
}

/// Conversational prompt over the last `window` turns.
pub fn chat_prompt(turns: &[ChatTurn], context: &str, window: usize) -> String {
    let mut prompt = String::from("你是一位专业的医疗AI助手，具有丰富的医学知识和临床经验。\n\n");

    if context.is_empty() {
        prompt.push_str(
            "请注意：我没有找到与用户问题相关的医学知识。

请根据以下情况判断用户输入的性质：

1. 如果用户只是简单的问候（如\"你好\"、\"您好\"等），请友好地回应并引导用户描述具体的健康问题。

2. 如果用户询问的是医疗相关问题，但没有找到相关医学知识，请：
- 理解用户的问题和关注点
- 提供一般性的健康建议
- 强烈建议用户咨询专业医生
- 强调此回答仅供参考，不能替代专业诊断

3. 如果用户的问题不明确，请询问更多细节以便提供更好的帮助。

",
        );
        prompt.push_str(CAUTIOUS_REQUIREMENTS);
    } else {
        prompt.push_str(&format!("相关医学知识：\n{}\n\n", context));
        prompt.push_str("请根据用户的问题和提供的医学知识，给出专业、准确、实用的医疗建议。\n\n");
        prompt.push_str(GENERAL_FORMAT);
    }

    prompt.push_str("\n\n对话历史：\n");
    let start = turns.len().saturating_sub(window);
    for turn in &turns[start..] {
        let role = if turn.is_user() { "用户" } else { "助手" };
        prompt.push_str(&format!("{}：{}\n", role, turn.content));
    }
    prompt
}

/// Digest request for the summarizer.
pub fn summary_prompt(question: &str, passages: &str, max_length: usize) -> String {
    format!(
        "基于以下医学知识，生成不超过{n}字的简洁摘要，重点回答\"{q}\"：\n\n{p}\n\n要求：摘要必须控制在{n}字以内，简洁明了。\n摘要：",
        n = max_length,
        q = question,
        p = passages
    )
}

/// Render `template` with `context`, shrinking the context until the
/// prompt fits in `max_prompt_chars`. The question and instructions are
/// never cut.
pub fn fit_prompt<F>(template: F, context: &str, max_prompt_chars: usize) -> String
where
    F: Fn(&str) -> String,
{
    let full = template(context);
    if full.chars().count() <= max_prompt_chars {
        return full;
    }
    let overhead = template("").chars().count();
    let budget = max_prompt_chars.saturating_sub(overhead);
    template(&truncate_chars(context, budget))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_type_lenient() {
        assert_eq!(ResponseType::from_name("Diagnosis"), ResponseType::Diagnosis);
        assert_eq!(ResponseType::from_name("triage"), ResponseType::General);
        let rt: ResponseType = serde_json::from_str("\"unknown\"").unwrap();
        assert_eq!(rt, ResponseType::General);
    }

    #[test]
    fn test_build_context_caps_length() {
        assert_eq!(build_context("  ", 800), "");
        let ctx = build_context(&"血".repeat(2000), 800);
        assert_eq!(ctx.chars().count(), 803);
        assert!(ctx.ends_with("..."));
        assert!(ctx.starts_with("基于以下医学知识摘要"));
    }

    #[test]
    fn test_medical_prompt_sections() {
        let p = medical_prompt(ResponseType::General, "头痛怎么办", "上下文");
        for section in ["【症状分析】", "【专业建议】", "【就医指导】", "【注意事项】"] {
            assert!(p.contains(section));
        }
        assert!(medical_prompt(ResponseType::Diagnosis, "q", "c").contains("诊断依据"));
        assert!(no_context_prompt("q").contains("【重要提醒】"));
    }

    #[test]
    fn test_chat_prompt_window_and_labels() {
        let turns: Vec<ChatTurn> = (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    ChatTurn::user(format!("问题{}", i))
                } else {
                    ChatTurn::assistant(format!("回答{}", i))
                }
            })
            .collect();
        let p = chat_prompt(&turns, "", 6);
        assert!(!p.contains("问题0"));
        assert!(!p.contains("回答1"));
        assert!(p.contains("用户：问题2"));
        assert!(p.contains("助手：回答7"));
        assert!(p.contains("没有找到与用户问题相关的医学知识"));
    }

    #[test]
    fn test_fit_prompt_shrinks_context_only() {
        let context = "知".repeat(500);
        let p = fit_prompt(|c| medical_prompt(ResponseType::Advice, "如何预防感冒", c), &context, 300);
        assert!(p.chars().count() <= 300);
        assert!(p.contains("如何预防感冒"));
    }
}
