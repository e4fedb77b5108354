use crate::op::{Cmp, ConstLoad, Op};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("illegal token: {0}")]
    IllegalToken(String),
    #[error("failed to convert '{0}' to float")]
    InvalidNumber(String),
    #[error("failed to convert '{0}' to float, not the whole token could be converted")]
    TrailingGarbage(String),
}

/// Fixed tokens with no parsed payload.
static SIMPLE: Lazy<HashMap<&'static str, Op>> = Lazy::new(|| {
    HashMap::from([
        ("+", Op::Add),
        ("-", Op::Sub),
        ("*", Op::Mul),
        ("/", Op::Div),
        ("%", Op::Mod),
        ("sqrt", Op::Sqrt),
        ("abs", Op::Abs),
        ("max", Op::Max),
        ("min", Op::Min),
        ("<", Op::Cmp { kind: Cmp::Lt }),
        (">", Op::Cmp { kind: Cmp::Nle }),
        ("=", Op::Cmp { kind: Cmp::Eq }),
        (">=", Op::Cmp { kind: Cmp::Nlt }),
        ("<=", Op::Cmp { kind: Cmp::Le }),
        ("trunc", Op::Trunc),
        ("round", Op::Round),
        ("floor", Op::Floor),
        ("and", Op::And),
        ("or", Op::Or),
        ("xor", Op::Xor),
        ("not", Op::Not),
        ("?", Op::Ternary),
        ("exp", Op::Exp),
        ("log", Op::Log),
        ("pow", Op::Pow),
        ("sin", Op::Sin),
        ("cos", Op::Cos),
        ("dup", Op::Dup { depth: 0 }),
        ("swap", Op::Swap { depth: 1 }),
        (
            "pi",
            Op::Constant {
                value: std::f32::consts::PI,
            },
        ),
        ("N", Op::LoadConst { which: ConstLoad::N }),
        ("X", Op::LoadConst { which: ConstLoad::X }),
        ("Y", Op::LoadConst { which: ConstLoad::Y }),
    ])
});

/// Clip letters map `x y z` to inputs 0..2 and `a`..`w` to 3..25.
fn clip_index(letter: u8) -> usize {
    if letter >= b'x' {
        (letter - b'x') as usize
    } else {
        (letter - b'a') as usize + 3
    }
}

/// Decodes one whitespace-delimited token into an opcode.
pub fn decode_token(token: &str) -> Result<Op, DecodeError> {
    if let Some(op) = SIMPLE.get(token) {
        return Ok(op.clone());
    }

    let bytes = token.as_bytes();
    if bytes.len() == 1 && bytes[0].is_ascii_lowercase() {
        return Ok(Op::MemLoad {
            clip: clip_index(bytes[0]),
        });
    }

    if let Some(suffix) = token.strip_prefix("dup").or_else(|| token.strip_prefix("swap")) {
        let depth = suffix
            .parse::<i32>()
            .ok()
            .filter(|d| *d >= 0)
            .ok_or_else(|| DecodeError::IllegalToken(token.to_string()))?;
        return Ok(if bytes[0] == b'd' {
            Op::Dup {
                depth: depth as u32,
            }
        } else {
            Op::Swap {
                depth: depth as u32,
            }
        });
    }

    if bytes.len() >= 3 && bytes[0].is_ascii_lowercase() && bytes[1] == b'.' {
        return Ok(Op::LoadConst {
            which: ConstLoad::Prop {
                clip: clip_index(bytes[0]),
                name: token[2..].to_string(),
            },
        });
    }

    match token.parse::<f32>() {
        Ok(value) => Ok(Op::Constant { value }),
        // Distinguish a trailing-garbage literal like `1.5x` from something
        // that never was a number, matching the two messages hosts key on.
        Err(_) if (1..token.len())
            .filter(|n| token.is_char_boundary(*n))
            .any(|n| token[..n].parse::<f32>().is_ok()) =>
        {
            Err(DecodeError::TrailingGarbage(token.to_string()))
        }
        Err(_) => Err(DecodeError::InvalidNumber(token.to_string())),
    }
}

/// Decodes a whole token sequence, keeping order.
pub fn decode(tokens: &[&str]) -> Result<Vec<Op>, DecodeError> {
    tokens.iter().map(|tok| decode_token(tok)).collect()
}
