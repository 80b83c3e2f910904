//! Base64/hex/tokenized-numeric encoding detection, short tokenized-string
//! decoding, and recognition of hostile literal patterns.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::bytecode::{Instruction, MethodDef, Opcode, Operand};

const TOKEN_SEPARATORS: &[char] = &['-', '`', ':', ',', ' '];

static HEX_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(0[xX])?[0-9A-Fa-f]{8,}$").unwrap());

static URL_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)https?://[^\s]+").unwrap());

static SHELL_HOST_LITERALS: &[&str] = &[
    "powershell",
    "powershell.exe",
    "cmd.exe",
    "mshta",
    "mshta.exe",
    "wscript.exe",
    "cscript.exe",
    "rundll32.exe",
    "regsvr32.exe",
];

/// True iff `literal` is at least `min_len` characters long AND looks like
/// either tokenized numeric/hex encoding, or a classic hex blob:
/// - tokenized: a separator from `-`, `` ` ``, `:`, `,`, space occurs more
///   than 3 times AND more than 30% of characters are digits; or
/// - hex: matches an (optionally `0x`-prefixed) hex string of length ≥ 8.
pub fn is_likely_encoded(literal: &str, min_len: usize) -> bool {
    if literal.len() < min_len {
        return false;
    }

    let separator_count = literal.chars().filter(|c| TOKEN_SEPARATORS.contains(c)).count();
    let digit_ratio = if literal.is_empty() {
        0.0
    } else {
        literal.chars().filter(|c| c.is_ascii_digit()).count() as f32 / literal.len() as f32
    };
    let tokenized = separator_count > 3 && digit_ratio > 0.3;

    tokenized || HEX_SHAPE.is_match(literal)
}

/// Attempts dash-separated, backtick-separated, mixed-separator ASCII codes,
/// then hex. Every decoded byte must be printable ASCII (`32..=126`) and the
/// resulting string must be at least 4 characters. URLs are surfaced as
/// `[URL] ...`; results over 100 chars are truncated.
pub fn try_decode(literal: &str) -> Option<String> {
    let decoded = decode_dash_separated(literal)
        .or_else(|| decode_separated(literal, '`'))
        .or_else(|| decode_mixed_separated(literal))
        .or_else(|| decode_hex(literal))?;

    if decoded.len() < 4 {
        return None;
    }

    let formatted = if URL_LIKE.is_match(&decoded) {
        format!("[URL] {decoded}")
    } else {
        decoded
    };

    Some(truncate(&formatted, 100))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn decode_dash_separated(literal: &str) -> Option<String> {
    decode_separated(literal, '-')
}

fn decode_separated(literal: &str, sep: char) -> Option<String> {
    if !literal.contains(sep) {
        return None;
    }
    let tokens: Vec<&str> = literal.split(sep).collect();
    if tokens.len() < 2 {
        return None;
    }
    decode_ascii_codes(&tokens)
}

fn decode_mixed_separated(literal: &str) -> Option<String> {
    let tokens: Vec<&str> = literal
        .split(|c: char| TOKEN_SEPARATORS.contains(&c))
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() < 2 {
        return None;
    }
    decode_ascii_codes(&tokens)
}

fn decode_ascii_codes(tokens: &[&str]) -> Option<String> {
    let mut out = String::with_capacity(tokens.len());
    for tok in tokens {
        let code: u32 = tok.parse().ok()?;
        if !(32..=126).contains(&code) {
            return None;
        }
        out.push(char::from_u32(code)?);
    }
    Some(out)
}

fn decode_hex(literal: &str) -> Option<String> {
    let stripped = literal
        .strip_prefix("0x")
        .or_else(|| literal.strip_prefix("0X"))
        .unwrap_or(literal);
    if stripped.len() < 8 || stripped.len() % 2 != 0 {
        return None;
    }
    let bytes = hex::decode(stripped).ok()?;
    let mut out = String::with_capacity(bytes.len());
    for b in bytes {
        if !(32..=126).contains(&b) {
            return None;
        }
        out.push(b as char);
    }
    Some(out)
}

/// Scans a method body for calls to `Assembly.Load`/`Assembly.LoadFrom`.
pub fn has_assembly_loading_in_method(method: &MethodDef) -> bool {
    method.instructions().iter().any(|i| is_assembly_load_call(i))
}

fn is_assembly_load_call(instr: &Instruction) -> bool {
    matches!(&instr.opcode, Opcode::Call | Opcode::CallVirt)
        && matches!(&instr.operand, Operand::Method(m)
            if m.declaring_type == "System.Reflection.Assembly"
                && (m.name == "Load" || m.name == "LoadFrom"))
}

/// True if a window around `index` contains a recognized hostile literal:
/// a shell-host executable name, a base64-decode call paired with a nearby
/// `ldstr`, or a decoded encoded literal.
pub fn has_suspicious_string_patterns(instructions: &[Instruction], index: usize, min_encoded_len: usize) -> bool {
    let radius = 6usize;
    let start = index.saturating_sub(radius);
    let end = (index + radius + 1).min(instructions.len());
    let window = &instructions[start..end];

    let has_shell_literal = window.iter().any(|i| match &i.operand {
        Operand::String(s) => is_shell_host_literal(s),
        _ => false,
    });

    let has_base64_decode_with_literal = window.iter().any(is_base64_decode_call)
        && window.iter().any(|i| matches!(i.operand, Operand::String(_)));

    let has_decoded_literal = window.iter().any(|i| match &i.operand {
        Operand::String(s) => {
            is_likely_encoded(s, min_encoded_len) && try_decode(s).is_some()
        }
        _ => false,
    });

    has_shell_literal || has_base64_decode_with_literal || has_decoded_literal
}

pub fn is_shell_host_literal(literal: &str) -> bool {
    let lower = literal.to_ascii_lowercase();
    SHELL_HOST_LITERALS.iter().any(|host| lower.contains(host))
}

fn is_base64_decode_call(instr: &Instruction) -> bool {
    matches!(&instr.opcode, Opcode::Call | Opcode::CallVirt)
        && matches!(&instr.operand, Operand::Method(m)
            if m.declaring_type == "System.Convert" && m.name == "FromBase64String")
}
