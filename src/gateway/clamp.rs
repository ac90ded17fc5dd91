//! 回复长度限制：代理脚本内存有限，回复按 UTF-8 字节数截断

const ELLIPSIS: &str = "…";

/// 截取不超过 max_bytes 字节的最长前缀（不切断字符）
pub fn trim_to_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// 超长时优先在最后一个句末标点处截断，否则截断后追加省略号
pub fn clamp_reply(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let trimmed = trim_to_bytes(text, max_bytes);
    if let Some(boundary) = trimmed.rfind(|c| matches!(c, '.' | '!' | '?')) {
        return trimmed[..=boundary].to_string();
    }

    let budget = max_bytes.saturating_sub(ELLIPSIS.len());
    format!("{}{}", trim_to_bytes(text, budget), ELLIPSIS)
}
