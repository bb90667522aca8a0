//! # Pipeline parser
//!
//! Splits a pipeline string like `docs.users.find(id,10).collects(name,age)`
//! into ordered stage tokens, and a single stage into its method name and
//! argument list. Both splits track depth across the symmetric delimiters
//! `()`, `{}`, `[]` and the three quote styles, so arguments may carry
//! embedded JSON objects, nested lists, and dotted keys.

/// Depth tracker for the pipeline's symmetric delimiters. Inside a quote,
/// only the matching quote character is significant.
#[derive(Default)]
struct Depth {
    paren: i32,
    brace: i32,
    bracket: i32,
    quote: Option<char>,
}

impl Depth {
    fn at_surface(&self) -> bool {
        self.paren == 0 && self.brace == 0 && self.bracket == 0 && self.quote.is_none()
    }

    fn observe(&mut self, c: char) {
        if let Some(q) = self.quote {
            if c == q {
                self.quote = None;
            }
            return;
        }
        match c {
            '(' => self.paren += 1,
            ')' => self.paren -= 1,
            '{' => self.brace += 1,
            '}' => self.brace -= 1,
            '[' => self.bracket += 1,
            ']' => self.bracket -= 1,
            '"' | '\'' | '`' => self.quote = Some(c),
            _ => {}
        }
    }
}

fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Split a pipeline string into its ordered tokens.
///
/// A valid pipeline is `root.sub` followed by at least one stage; the first
/// two tokens must be bare identifiers, and every stage token that opens a
/// parenthesis must close it.
pub fn parse_query(raw: &str) -> Result<Vec<String>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty pipeline".into());
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = Depth::default();

    for c in raw.chars() {
        if c == '.' && depth.at_surface() {
            if current.is_empty() {
                return Err("empty pipeline segment".into());
            }
            tokens.push(std::mem::take(&mut current));
        } else {
            depth.observe(c);
            current.push(c);
        }
    }

    if depth.quote.is_some() {
        return Err("unbalanced quote in pipeline".into());
    }
    if depth.paren != 0 {
        return Err("unclosed parenthesis in pipeline".into());
    }
    if depth.brace != 0 || depth.bracket != 0 {
        return Err("unbalanced braces in pipeline".into());
    }
    if current.is_empty() {
        return Err("pipeline ends with a separator".into());
    }
    tokens.push(current);

    if tokens.len() < 3 {
        return Err(format!(
            "pipeline '{raw}' needs a root, a sub-path, and at least one stage"
        ));
    }
    if !is_ident(&tokens[0]) || !is_ident(&tokens[1]) {
        return Err(format!(
            "pipeline '{raw}' must start with two bare identifiers"
        ));
    }
    for token in &tokens[2..] {
        if token.contains('(') && !token.ends_with(')') {
            return Err(format!("stage '{token}' has an unclosed call"));
        }
    }

    Ok(tokens)
}

/// Split one stage token into its method name and argument list. A bare
/// identifier yields an empty argument list.
pub fn split_stage(token: &str) -> (String, Vec<String>) {
    let Some(open) = token.find('(') else {
        return (token.trim().to_string(), Vec::new());
    };

    let name = token[..open].trim().to_string();
    let inner = token[open + 1..].strip_suffix(')').unwrap_or(&token[open + 1..]);
    (name, split_args(inner))
}

/// Depth-aware split of a stage's argument string on `,`.
pub fn split_args(inner: &str) -> Vec<String> {
    if inner.trim().is_empty() {
        return Vec::new();
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = Depth::default();

    for c in inner.chars() {
        if c == ',' && depth.at_surface() {
            args.push(std::mem::take(&mut current));
        } else {
            depth.observe(c);
            current.push(c);
        }
    }
    args.push(current);

    args.into_iter().map(|a| a.trim().to_string()).collect()
}

/// Strip one layer of matching surrounding quotes off an argument.
pub fn unquote(arg: &str) -> String {
    let arg = arg.trim();
    let mut chars = arg.chars();
    match (chars.next(), arg.chars().last()) {
        (Some(open), Some(close))
            if arg.len() >= 2 && open == close && matches!(open, '"' | '\'' | '`') =>
        {
            arg[1..arg.len() - 1].to_string()
        }
        _ => arg.to_string(),
    }
}
