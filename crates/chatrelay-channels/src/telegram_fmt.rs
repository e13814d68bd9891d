//! Conversion of model output (common Markdown) into Telegram MarkdownV2.
//!
//! MarkdownV2 rejects unescaped punctuation from a fixed set (see `SPECIAL`)
//! outside entities, so plain text is escaped character by character while
//! the few constructs models actually emit are translated:
//!
//! - fenced code blocks and inline code keep their content, with only `` ` ``
//!   and `\` escaped as Telegram requires inside code;
//! - `**bold**` becomes `*bold*`;
//! - `[text](url)` links are kept, escaping `)` and `\` in the URL.
//!
//! Unbalanced markers are treated as literal text.

const SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

pub fn to_telegram_markdown(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + input.len() / 4);
    let mut rest = input;

    while let Some(ch) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix("```") {
            rest = push_fenced_block(&mut out, after);
            continue;
        }

        if let Some(after) = rest.strip_prefix('`')
            && let Some(end) = after.find('`')
        {
            out.push('`');
            push_code(&mut out, &after[..end]);
            out.push('`');
            rest = &after[end + 1..];
            continue;
        }

        if let Some(after) = rest.strip_prefix("**")
            && let Some(end) = after.find("**").filter(|&end| end > 0)
        {
            out.push('*');
            push_escaped(&mut out, &after[..end]);
            out.push('*');
            rest = &after[end + 2..];
            continue;
        }

        if let Some((text, url, remaining)) = split_link(rest) {
            out.push('[');
            push_escaped(&mut out, text);
            out.push_str("](");
            for c in url.chars() {
                if c == ')' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push(')');
            rest = remaining;
            continue;
        }

        push_escaped_char(&mut out, ch);
        rest = &rest[ch.len_utf8()..];
    }

    out
}

/// Emit a fenced block whose opening fence was already consumed. Returns the
/// input left after the closing fence; an unclosed block runs to the end.
fn push_fenced_block<'a>(out: &mut String, after_fence: &'a str) -> &'a str {
    let (header, body_and_rest) = match after_fence.find('\n') {
        Some(nl) => (&after_fence[..nl], &after_fence[nl..]),
        None => (after_fence, ""),
    };
    let (body, rest) = match body_and_rest.find("```") {
        Some(end) => (&body_and_rest[..end], &body_and_rest[end + 3..]),
        None => (body_and_rest, ""),
    };

    out.push_str("```");
    out.push_str(header.trim());
    push_code(out, body);
    out.push_str("```");
    rest
}

fn push_code(out: &mut String, code: &str) {
    for c in code.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        push_escaped_char(out, c);
    }
}

fn push_escaped_char(out: &mut String, c: char) {
    if SPECIAL.contains(&c) {
        out.push('\\');
    }
    out.push(c);
}

/// Split `[text](url)rest` into its parts.
fn split_link(input: &str) -> Option<(&str, &str, &str)> {
    let after_open = input.strip_prefix('[')?;
    let close = after_open.find(']')?;
    let text = &after_open[..close];
    let after_text = after_open[close + 1..].strip_prefix('(')?;
    let url_end = after_text.find(')')?;
    let url = &after_text[..url_end];
    if text.is_empty() || url.is_empty() || text.contains('\n') || url.contains(char::is_whitespace)
    {
        return None;
    }
    Some((text, url, &after_text[url_end + 1..]))
}
