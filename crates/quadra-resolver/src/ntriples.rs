//! N-Triples term writing and parsing.

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, map, opt, value},
    sequence::{delimited, preceded, terminated, tuple},
    IResult,
};
use quadra_spi::{Error, GlobalNode, Result};
use std::io::Write;

// ============================================================================
// Writer
// ============================================================================

fn escape(lexical: &str) -> String {
    let mut out = String::with_capacity(lexical.len());
    for c in lexical.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// One term in N-Triples syntax.
pub fn format_term(node: &GlobalNode) -> String {
    match node {
        GlobalNode::Uri(uri) => format!("<{uri}>"),
        GlobalNode::Blank(label) => format!("_:{label}"),
        GlobalNode::Literal {
            lexical,
            datatype,
            language,
        } => {
            let mut out = format!("\"{}\"", escape(lexical));
            if let Some(lang) = language {
                out.push('@');
                out.push_str(lang);
            } else if let Some(dt) = datatype {
                out.push_str("^^<");
                out.push_str(dt);
                out.push('>');
            }
            out
        }
    }
}

pub fn write_statement(
    out: &mut dyn Write,
    subject: &GlobalNode,
    predicate: &GlobalNode,
    object: &GlobalNode,
) -> Result<()> {
    writeln!(
        out,
        "{} {} {} .",
        format_term(subject),
        format_term(predicate),
        format_term(object)
    )
    .map_err(|err| Error::Query(format!("export write failed: {err}")))
}

// ============================================================================
// Parser
// ============================================================================

fn iri(input: &str) -> IResult<&str, String> {
    map(delimited(char('<'), is_not(">"), char('>')), |uri: &str| uri.to_string())(input)
}

fn blank(input: &str) -> IResult<&str, GlobalNode> {
    map(
        preceded(
            tag("_:"),
            take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
        ),
        |label: &str| GlobalNode::Blank(label.to_string()),
    )(input)
}

fn lexical(input: &str) -> IResult<&str, String> {
    alt((
        // escaped_transform needs at least one character
        value(String::new(), tag("\"\"")),
        delimited(
            char('"'),
            escaped_transform(
                is_not("\\\""),
                '\\',
                alt((
                    value("\\", char('\\')),
                    value("\"", char('"')),
                    value("\n", char('n')),
                    value("\r", char('r')),
                    value("\t", char('t')),
                )),
            ),
            char('"'),
        ),
    ))(input)
}

enum Suffix {
    Language(String),
    Datatype(String),
}

fn literal(input: &str) -> IResult<&str, GlobalNode> {
    let suffix = alt((
        map(
            preceded(
                char('@'),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'),
            ),
            |lang: &str| Suffix::Language(lang.to_string()),
        ),
        map(preceded(tag("^^"), iri), Suffix::Datatype),
    ));
    map(tuple((lexical, opt(suffix))), |(lexical, suffix)| {
        let (datatype, language) = match suffix {
            Some(Suffix::Language(lang)) => (None, Some(lang)),
            Some(Suffix::Datatype(dt)) => (Some(dt), None),
            None => (None, None),
        };
        GlobalNode::Literal {
            lexical,
            datatype,
            language,
        }
    })(input)
}

/// Streaming term parser, for callers embedding terms in a larger grammar.
pub fn term(input: &str) -> IResult<&str, GlobalNode> {
    alt((map(iri, GlobalNode::Uri), blank, literal))(input)
}

/// Parses a single term such as `<urn:a>`, `"x"@en` or `_:b1`.
pub fn parse_term(input: &str) -> Result<GlobalNode> {
    all_consuming(delimited(multispace0, term, multispace0))(input)
        .map(|(_, node)| node)
        .map_err(|err| Error::InvalidArgument(format!("bad term {input:?}: {err}")))
}

/// Parses one `subject predicate object .` line.
pub fn parse_statement(line: &str) -> Result<(GlobalNode, GlobalNode, GlobalNode)> {
    let statement = tuple((
        preceded(multispace0, term),
        preceded(multispace1, term),
        preceded(multispace1, term),
    ));
    all_consuming(terminated(
        statement,
        tuple((multispace0, char('.'), multispace0)),
    ))(line)
    .map(|(_, triple)| triple)
    .map_err(|err| Error::InvalidArgument(format!("bad statement {line:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each_term_kind() {
        assert_eq!(parse_term("<urn:a>").unwrap(), GlobalNode::uri("urn:a"));
        assert_eq!(parse_term(" _:b1 ").unwrap(), GlobalNode::Blank("b1".into()));
        assert_eq!(parse_term("\"hi\"").unwrap(), GlobalNode::literal("hi"));
        assert_eq!(parse_term("\"\"").unwrap(), GlobalNode::literal(""));
        assert_eq!(
            parse_term("\"5\"^^<http://www.w3.org/2001/XMLSchema#int>").unwrap(),
            GlobalNode::typed_literal("5", "http://www.w3.org/2001/XMLSchema#int")
        );
        let GlobalNode::Literal { language, .. } = parse_term("\"chat\"@fr").unwrap() else {
            panic!("expected literal");
        };
        assert_eq!(language.as_deref(), Some("fr"));
    }

    #[test]
    fn test_escapes_survive_write_and_parse() {
        let node = GlobalNode::literal("say \"hi\"\n\\done");
        let written = format_term(&node);
        assert_eq!(written, "\"say \\\"hi\\\"\\n\\\\done\"");
        assert_eq!(parse_term(&written).unwrap(), node);
    }

    #[test]
    fn test_parse_statement_line() {
        let (s, p, o) = parse_statement("<urn:s> <urn:p> \"o\" .").unwrap();
        assert_eq!(s, GlobalNode::uri("urn:s"));
        assert_eq!(p, GlobalNode::uri("urn:p"));
        assert_eq!(o, GlobalNode::literal("o"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_term("urn:a").is_err());
        assert!(parse_statement("<urn:s> <urn:p> .").is_err());
    }

    #[test]
    fn test_write_statement() {
        let mut out = Vec::new();
        write_statement(
            &mut out,
            &GlobalNode::uri("urn:s"),
            &GlobalNode::uri("urn:p"),
            &GlobalNode::Blank("b".into()),
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "<urn:s> <urn:p> _:b .\n");
    }
}
