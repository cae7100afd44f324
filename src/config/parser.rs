use super::ConfigError;

/// Syntax tree of a pkgproxy configuration file.
#[derive(Debug, Default)]
pub struct ConfigFile {
    /// Top-level `name value...;` statements in file order.
    pub directives: Vec<Directive>,
    /// `service <name> { ... }` blocks in file order.
    pub services: Vec<ServiceBlock>,
}

/// A `name value...;` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub values: Vec<String>,
    pub line: usize,
}

/// A `service <name> { regex ...; ttl ...; }` block.
#[derive(Debug, Default)]
pub struct ServiceBlock {
    pub name: String,
    pub directives: Vec<Directive>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    line: usize,
    /// Quoted strings are never structural, even if they contain `{` or `;`.
    quoted: bool,
}

impl Token {
    fn is(&self, structural: &str) -> bool {
        !self.quoted && self.text == structural
    }
}

/// Parses configuration text into a [`ConfigFile`].
///
/// ```text
/// listen_port 8080;
/// proxy_networks 10.0.0.0/8 192.168.0.0/16;
/// service ubuntu_1y {
///     regex "^ubuntu-1y\.";
///     ttl 1y;
/// }
/// ```
pub fn parse_config_file(input: &str) -> Result<ConfigFile, ConfigError> {
    let tokens = tokenize(input)?;
    let mut file = ConfigFile::default();
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        if token.is("}") || token.is(";") || token.is("{") {
            return Err(syntax(token.line, format!("unexpected '{}'", token.text)));
        }

        // `service <name> { ... }`
        if token.is("service") {
            let name = tokens
                .get(i + 1)
                .filter(|t| !t.is("{") && !t.is(";"))
                .ok_or_else(|| syntax(token.line, "service block needs a name"))?;
            if !tokens.get(i + 2).is_some_and(|t| t.is("{")) {
                return Err(syntax(token.line, "expected '{' after service name"));
            }
            let (directives, next) = parse_block(&tokens, i + 3, token.line)?;
            file.services.push(ServiceBlock {
                name: name.text.clone(),
                directives,
                line: token.line,
            });
            i = next;
            continue;
        }

        let (directive, next) = parse_directive(&tokens, i)?;
        file.directives.push(directive);
        i = next;
    }

    Ok(file)
}

/// Parses directives up to the closing brace of a block opened on `open_line`.
fn parse_block(
    tokens: &[Token],
    mut i: usize,
    open_line: usize,
) -> Result<(Vec<Directive>, usize), ConfigError> {
    let mut directives = Vec::new();
    while i < tokens.len() {
        if tokens[i].is("}") {
            return Ok((directives, i + 1));
        }
        if tokens[i].is("{") {
            return Err(syntax(tokens[i].line, "nested blocks are not supported"));
        }
        let (directive, next) = parse_directive(tokens, i)?;
        directives.push(directive);
        i = next;
    }
    Err(syntax(open_line, "block is never closed"))
}

/// Parses `name value...;` starting at `i`.
fn parse_directive(tokens: &[Token], i: usize) -> Result<(Directive, usize), ConfigError> {
    let name = &tokens[i];
    let mut values = Vec::new();
    let mut j = i + 1;
    while j < tokens.len() {
        let token = &tokens[j];
        if token.is(";") {
            return Ok((
                Directive {
                    name: name.text.clone(),
                    values,
                    line: name.line,
                },
                j + 1,
            ));
        }
        if token.is("{") || token.is("}") {
            return Err(syntax(
                token.line,
                format!("missing ';' after '{}'", name.text),
            ));
        }
        values.push(token.text.clone());
        j += 1;
    }
    Err(syntax(name.line, format!("missing ';' after '{}'", name.text)))
}

/// Splits the input into words, quoted strings and the structural characters
/// `{`, `}` and `;`. `#` starts a comment running to the end of the line.
fn tokenize(input: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut line = 1;
    let mut quote: Option<(char, usize)> = None;
    let mut in_comment = false;

    let flush = |current: &mut String, tokens: &mut Vec<Token>, line: usize| {
        if !current.is_empty() {
            tokens.push(Token {
                text: std::mem::take(current),
                line,
                quoted: false,
            });
        }
    };

    for c in input.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
                line += 1;
            }
            continue;
        }

        if let Some((q, start)) = quote {
            if c == q {
                tokens.push(Token {
                    text: std::mem::take(&mut current),
                    line: start,
                    quoted: true,
                });
                quote = None;
            } else {
                if c == '\n' {
                    line += 1;
                }
                current.push(c);
            }
            continue;
        }

        match c {
            '"' | '\'' => {
                flush(&mut current, &mut tokens, line);
                quote = Some((c, line));
            }
            '#' => {
                flush(&mut current, &mut tokens, line);
                in_comment = true;
            }
            '{' | '}' | ';' => {
                flush(&mut current, &mut tokens, line);
                tokens.push(Token {
                    text: c.to_string(),
                    line,
                    quoted: false,
                });
            }
            c if c.is_whitespace() => {
                flush(&mut current, &mut tokens, line);
                if c == '\n' {
                    line += 1;
                }
            }
            c => current.push(c),
        }
    }

    if let Some((_, start)) = quote {
        return Err(syntax(start, "unterminated quoted string"));
    }
    flush(&mut current, &mut tokens, line);
    Ok(tokens)
}

fn syntax(line: usize, message: impl Into<String>) -> ConfigError {
    ConfigError::Syntax {
        line,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_directives_and_service_blocks() {
        let file = parse_config_file(
            r#"
            # listener
            listen_port 8080;
            proxy_networks 10.0.0.0/8 192.168.0.0/16;
            service ubuntu_1y {
                regex "^ubuntu-1y\.";
                ttl 1y;
            }
            "#,
        )
        .unwrap();

        assert_eq!(file.directives.len(), 2);
        assert_eq!(file.directives[0].name, "listen_port");
        assert_eq!(file.directives[0].values, vec!["8080"]);
        assert_eq!(file.directives[0].line, 3);
        assert_eq!(
            file.directives[1].values,
            vec!["10.0.0.0/8", "192.168.0.0/16"]
        );

        assert_eq!(file.services.len(), 1);
        let service = &file.services[0];
        assert_eq!(service.name, "ubuntu_1y");
        assert_eq!(service.directives[0].values, vec![r"^ubuntu-1y\."]);
        assert_eq!(service.directives[1].name, "ttl");
    }

    #[test]
    fn quoted_values_keep_spaces_and_structural_chars() {
        let file = parse_config_file("prometheus_metric_prefix 'a {b};';\nx \"\";").unwrap();
        assert_eq!(file.directives[0].values, vec!["a {b};"]);
        assert_eq!(file.directives[1].values, vec![""]);
    }

    #[test]
    fn reports_syntax_errors_with_lines() {
        let cases = [
            ("listen_port 8080", 1),
            ("listen_port 8080;\n}", 2),
            ("service a {\n ttl 1h;\n", 1),
            ("service {", 1),
            ("debug true;\nservice a { ttl 1h }", 2),
            ("local_root \"/srv;", 1),
        ];
        for (input, expected_line) in cases {
            match parse_config_file(input) {
                Err(ConfigError::Syntax { line, .. }) => {
                    assert_eq!(line, expected_line, "input: {input:?}")
                }
                other => panic!("expected syntax error for {input:?}, got {other:?}"),
            }
        }
    }
}
