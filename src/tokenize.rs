/// Splits an expression on ASCII whitespace, preserving token order.
///
/// Separators are the C `isspace` set: space, tab, LF, VT, FF, CR. Runs of
/// separators produce no empty tokens. This is the only lexical structure an
/// expression has; everything else is the decoder's business.
pub fn tokenize(expr: &str) -> Vec<&str> {
    expr.split(is_separator).filter(|t| !t.is_empty()).collect()
}

fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\x0b' | '\x0c' | '\r')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(tokenize("x y +"), vec!["x", "y", "+"]);
        assert_eq!(tokenize("  x\t\ty \n+ "), vec!["x", "y", "+"]);
    }

    #[test]
    fn empty_input_yields_no_tokens() {
        assert!(tokenize("").is_empty());
        assert!(tokenize(" \t\r\n").is_empty());
    }

    #[test]
    fn vertical_tab_and_form_feed_separate() {
        assert_eq!(tokenize("a\x0bb\x0cc"), vec!["a", "b", "c"]);
    }

    #[test]
    fn single_token_without_separators() {
        assert_eq!(tokenize("sqrt"), vec!["sqrt"]);
    }
}
