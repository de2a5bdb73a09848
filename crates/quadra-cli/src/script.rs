//! Line-oriented command scripts for `quadra run`.
//!
//! One command per line. Blank lines and lines starting with `#` are skipped.
//!
//! ```text
//! create <urn:g> [<urn:type>]
//! create-default <urn:g> <urn:type>
//! remove <urn:g>
//! exists <urn:g>
//! insert <urn:g> <urn:s> <urn:p> "object" .
//! delete <urn:g> <urn:s> <urn:p> "object" .
//! load <urn:g> data/file.nt
//! select ?s ?o from <urn:g> [<urn:h> ...] where ?s <urn:p> ?o and ?o <urn:q> ?x or ... [optional ...] [minus ...]
//! select ?g ?s from ?g where ?s <urn:p> ?o
//! ask from <urn:g> where ...
//! preallocate <urn:node>
//! export <urn:g>
//! rules <urn:rules> <urn:base> <urn:dest>
//! login <urn:domain> user password
//! begin | commit | rollback
//! ```
//!
//! Several `from` graphs are combined by union. A `from` variable ranges over
//! every graph the session can see.

use anyhow::{anyhow, Result};
use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_till1, take_while1};
use nom::character::complete::{char as pchar, multispace0, multispace1};
use nom::combinator::{all_consuming, map, map_opt, map_res, opt, rest};
use nom::multi::{many0, separated_list1};
use nom::sequence::{delimited, preceded, terminated, tuple};
use nom::IResult;
use quadra_resolver::{ntriples, Query};
use quadra_spi::{
    Constraint, ConstraintElement, ConstraintExpression, GlobalNode, GraphExpression, Variable,
};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Create {
        graph: String,
        model_type: Option<String>,
    },
    CreateDefault {
        graph: String,
        model_type: String,
    },
    Remove {
        graph: String,
    },
    Exists {
        graph: String,
    },
    Modify {
        graph: String,
        triple: [GlobalNode; 3],
        insert: bool,
    },
    /// Inserts every statement of an N-Triples file.
    Load {
        graph: String,
        path: PathBuf,
    },
    Query(Query),
    Preallocate(GlobalNode),
    Export {
        graph: String,
    },
    Rules {
        rule_graph: String,
        base_graph: String,
        destination_graph: String,
    },
    Login {
        domain: String,
        user: String,
        password: String,
    },
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone)]
pub struct ScriptLine {
    /// 1-based line number in the source file
    pub number: usize,
    pub text: String,
    pub command: Command,
}

pub fn parse_script(source: &str) -> Result<Vec<ScriptLine>> {
    let mut lines = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let command = parse_command(text).map_err(|e| anyhow!("line {}: {e}", index + 1))?;
        lines.push(ScriptLine {
            number: index + 1,
            text: text.to_string(),
            command,
        });
    }
    Ok(lines)
}

pub fn parse_command(line: &str) -> Result<Command> {
    let (_, command) = all_consuming(ws(command))(line)
        .map_err(|e| anyhow!("failed to parse command {line:?}: {e:?}"))?;
    Ok(command)
}

// =============================================================================
// Parsing
// =============================================================================

fn command(input: &str) -> IResult<&str, Command> {
    alt((
        create_default,
        create,
        map(preceded(keyword("remove"), graph_uri), |graph| Command::Remove { graph }),
        map(preceded(keyword("exists"), graph_uri), |graph| Command::Exists { graph }),
        modify,
        load,
        select,
        ask,
        map(preceded(keyword("preallocate"), ntriples::term), Command::Preallocate),
        map(preceded(keyword("export"), graph_uri), |graph| Command::Export { graph }),
        rules,
        login,
        map(tag_no_case("begin"), |_| Command::Begin),
        map(tag_no_case("commit"), |_| Command::Commit),
        map(tag_no_case("rollback"), |_| Command::Rollback),
    ))(input)
}

fn create_default(input: &str) -> IResult<&str, Command> {
    map(
        preceded(
            keyword("create-default"),
            tuple((graph_uri, preceded(multispace1, graph_uri))),
        ),
        |(graph, model_type)| Command::CreateDefault { graph, model_type },
    )(input)
}

fn create(input: &str) -> IResult<&str, Command> {
    map(
        preceded(
            keyword("create"),
            tuple((graph_uri, opt(preceded(multispace1, graph_uri)))),
        ),
        |(graph, model_type)| Command::Create { graph, model_type },
    )(input)
}

fn modify(input: &str) -> IResult<&str, Command> {
    let operation = alt((
        map(keyword("insert"), |_| true),
        map(keyword("delete"), |_| false),
    ));
    map(
        tuple((operation, graph_uri, preceded(multispace1, triple))),
        |(insert, graph, triple)| Command::Modify {
            graph,
            triple,
            insert,
        },
    )(input)
}

fn load(input: &str) -> IResult<&str, Command> {
    let path = map_opt(rest, |path: &str| {
        let path = path.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    });
    map(
        preceded(keyword("load"), tuple((graph_uri, preceded(multispace1, path)))),
        |(graph, path)| Command::Load { graph, path },
    )(input)
}

fn select(input: &str) -> IResult<&str, Command> {
    map_res(
        preceded(
            keyword("select"),
            tuple((
                separated_list1(multispace1, variable),
                preceded(ws(tag_no_case("from")), graphs),
                preceded(ws(tag_no_case("where")), where_clause),
            )),
        ),
        |(variables, graph, where_clause)| {
            Query::select(variables, graph, where_clause).map(Command::Query)
        },
    )(input)
}

fn ask(input: &str) -> IResult<&str, Command> {
    map(
        preceded(
            tag_no_case("ask"),
            tuple((
                preceded(ws(tag_no_case("from")), graphs),
                preceded(ws(tag_no_case("where")), where_clause),
            )),
        ),
        |(graph, where_clause)| Command::Query(Query::ask(graph, where_clause)),
    )(input)
}

fn rules(input: &str) -> IResult<&str, Command> {
    map(
        preceded(
            keyword("rules"),
            tuple((
                graph_uri,
                preceded(multispace1, graph_uri),
                preceded(multispace1, graph_uri),
            )),
        ),
        |(rule_graph, base_graph, destination_graph)| Command::Rules {
            rule_graph,
            base_graph,
            destination_graph,
        },
    )(input)
}

fn login(input: &str) -> IResult<&str, Command> {
    map(
        preceded(
            keyword("login"),
            tuple((graph_uri, preceded(multispace1, token), preceded(multispace1, token))),
        ),
        |(domain, user, password)| Command::Login {
            domain,
            user: user.to_string(),
            password: password.to_string(),
        },
    )(input)
}

fn triple(input: &str) -> IResult<&str, [GlobalNode; 3]> {
    map(
        terminated(
            tuple((
                ntriples::term,
                preceded(multispace1, ntriples::term),
                preceded(multispace1, ntriples::term),
            )),
            opt(preceded(multispace0, pchar('.'))),
        ),
        |(s, p, o)| [s, p, o],
    )(input)
}

fn graphs(input: &str) -> IResult<&str, GraphExpression> {
    alt((
        map(variable, GraphExpression::Variable),
        map(separated_list1(multispace1, graph_uri), |uris| {
            uris.into_iter()
                .map(|uri| GraphExpression::resource(uri))
                .reduce(GraphExpression::union)
                .unwrap_or_else(|| GraphExpression::resource(String::new()))
        }),
    ))(input)
}

/// `disjunction [optional disjunction]* [minus disjunction]`
fn where_clause(input: &str) -> IResult<&str, ConstraintExpression> {
    map(
        tuple((
            disjunction,
            many0(preceded(ws(tag_no_case("optional")), disjunction)),
            opt(preceded(ws(tag_no_case("minus")), disjunction)),
        )),
        |(lhs, optionals, rhs)| {
            let lhs = optionals
                .into_iter()
                .fold(lhs, ConstraintExpression::optional_join);
            match rhs {
                Some(rhs) => ConstraintExpression::difference(lhs, rhs),
                None => lhs,
            }
        },
    )(input)
}

fn disjunction(input: &str) -> IResult<&str, ConstraintExpression> {
    map(
        separated_list1(ws(tag_no_case("or")), conjunction),
        |parts| collapse(parts, ConstraintExpression::Disjunction),
    )(input)
}

fn conjunction(input: &str) -> IResult<&str, ConstraintExpression> {
    map(
        separated_list1(ws(tag_no_case("and")), pattern),
        |parts| collapse(parts, ConstraintExpression::Conjunction),
    )(input)
}

fn collapse(
    mut parts: Vec<ConstraintExpression>,
    combine: fn(Vec<ConstraintExpression>) -> ConstraintExpression,
) -> ConstraintExpression {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        combine(parts)
    }
}

fn pattern(input: &str) -> IResult<&str, ConstraintExpression> {
    map(
        tuple((
            element,
            preceded(multispace1, element),
            preceded(multispace1, element),
        )),
        |(s, p, o)| ConstraintExpression::Pattern(Constraint::pattern(s, p, o)),
    )(input)
}

fn element(input: &str) -> IResult<&str, ConstraintElement> {
    alt((
        map(variable, ConstraintElement::Variable),
        map(ntriples::term, ConstraintElement::Global),
    ))(input)
}

fn variable(input: &str) -> IResult<&str, Variable> {
    map(
        preceded(
            pchar('?'),
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        ),
        |name: &str| Variable::new(name),
    )(input)
}

fn graph_uri(input: &str) -> IResult<&str, String> {
    map_opt(ntriples::term, |node| match node {
        GlobalNode::Uri(uri) => Some(uri),
        _ => None,
    })(input)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_till1(char::is_whitespace)(input)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(word), multispace1)
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}
