//! Quadra CLI
//!
//! Runs command scripts against an embedded in-memory database:
//! - `quadra run script.qs` executes a script line by line
//! - `quadra config` prints the default configuration
//!
//! Graphs whose URI uses the `mem:` scheme are served by an external
//! in-memory resolver, so they go through the cache when `mem` is listed in
//! `cached_schemes`.

mod script;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use quadra_resolver::ntriples::{self, format_term};
use quadra_resolver::{Answer, Database, DatabaseConfig, DatabaseSession, QueryAnswer};
use quadra_spi::{GlobalNode, ResolverFactory};
use quadra_store::MemoryResolverFactory;
use script::{Command, ScriptLine};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quadra")]
#[command(author, version, about = "Quadra: transactional RDF graph store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a command script against a fresh database
    Run {
        /// Script file
        script: PathBuf,

        /// Database configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log at debug level
        #[arg(short, long)]
        verbose: bool,

        /// Report failed lines and keep going
        #[arg(long)]
        keep_going: bool,
    },

    /// Print the default configuration as JSON
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            config,
            verbose,
            keep_going,
        } => cmd_run(&script, config.as_deref(), verbose, keep_going),
        Commands::Config => {
            println!("{}", DatabaseConfig::default().to_json_pretty()?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, level: &str) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        level.parse().unwrap_or(tracing::Level::INFO)
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open_database(config: DatabaseConfig) -> Result<Database> {
    let database = Database::builder(config)
        .with_scheme("mem", |_| {
            Ok(Arc::new(MemoryResolverFactory::external()) as Arc<dyn ResolverFactory>)
        })
        .build()?;
    Ok(database)
}

fn cmd_run(script: &Path, config: Option<&Path>, verbose: bool, keep_going: bool) -> Result<()> {
    let config = match config {
        Some(path) => DatabaseConfig::load(path)?,
        None => DatabaseConfig::default(),
    };
    init_logging(verbose, &config.log_level);

    let source = std::fs::read_to_string(script)
        .with_context(|| format!("failed to read script {}", script.display()))?;
    let lines = script::parse_script(&source)?;
    let base = script.parent().unwrap_or_else(|| Path::new("."));

    let database = open_database(config)?;
    let session = database.new_session()?;
    let mut failures = 0usize;
    for line in &lines {
        println!("{} {}", format!("{:>4}>", line.number).dimmed(), line.text);
        if let Err(err) = run_line(&session, line, base) {
            if !keep_going {
                for close in [session.close(), database.close()] {
                    if let Err(close) = close {
                        tracing::warn!(error = %close, "close after failed line also failed");
                    }
                }
                return Err(err.context(format!("line {}", line.number)));
            }
            println!("{} {err:#}", "error:".red().bold());
            failures += 1;
        }
    }
    session.close()?;
    database.close()?;

    if failures > 0 {
        return Err(anyhow!("{failures} of {} lines failed", lines.len()));
    }
    println!("{}", "Done.".green());
    Ok(())
}

fn run_line(session: &DatabaseSession, line: &ScriptLine, base: &Path) -> Result<()> {
    match &line.command {
        Command::Create { graph, model_type } => {
            report_created(graph, session.create_graph(graph, model_type.as_deref())?);
        }
        Command::CreateDefault { graph, model_type } => {
            report_created(graph, session.create_default_graph(graph, model_type)?);
        }
        Command::Remove { graph } => {
            session.remove_graph(graph)?;
            println!("  {} {graph}", "removed".green());
        }
        Command::Exists { graph } => {
            let exists = session.graph_exists(graph)?;
            println!("  {}", if exists { "true".green() } else { "false".yellow() });
        }
        Command::Modify {
            graph,
            triple,
            insert,
        } => {
            if *insert {
                session.insert(graph, vec![triple.clone()])?;
                println!("  {} 1 statement", "inserted".green());
            } else {
                let count = session.delete(graph, vec![triple.clone()])?;
                println!("  {} {count} statement(s)", "deleted".green());
            }
        }
        Command::Load { graph, path } => {
            let path = base.join(path);
            let statements = read_ntriples(&path)?;
            let count = session.insert(graph, statements)?;
            println!("  {} {count} statement(s) from {}", "loaded".green(), path.display());
        }
        Command::Query(query) => match session.query(query.clone())? {
            QueryAnswer::Boolean(value) => {
                println!("  {}", if value { "true".green() } else { "false".yellow() });
            }
            QueryAnswer::Rows(mut answer) => {
                let header = answer
                    .variables()
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("\t");
                let rows = answer.rows();
                answer.close()?;
                let rows = rows?;
                println!("  {}", header.bold());
                for row in &rows {
                    println!("  {}", render_row(row));
                }
                println!("  {}", format!("({} rows)", rows.len()).dimmed());
            }
        },
        Command::Preallocate(node) => {
            let id = session.preallocate(node.clone())?;
            println!("  {} {}", format_term(node), format!("= {id}").dimmed());
        }
        Command::Export { graph } => {
            let buffer = session.export(graph, Vec::new())?;
            std::io::stdout().write_all(&buffer)?;
        }
        Command::Rules {
            rule_graph,
            base_graph,
            destination_graph,
        } => {
            let rules = session.build_rules(rule_graph, base_graph, destination_graph)?;
            let inferred = session.apply_rules(rules)?;
            println!("  {} {inferred} statement(s)", "inferred".green());
        }
        Command::Login {
            domain,
            user,
            password,
        } => {
            session.login(domain, user, password)?;
            println!("  {} {user}", "logged in".green());
        }
        Command::Begin => session.set_auto_commit(false)?,
        Command::Commit => {
            session.commit()?;
            println!("  {}", "committed".green());
        }
        Command::Rollback => {
            session.rollback()?;
            println!("  {}", "rolled back".yellow());
        }
    }
    Ok(())
}

fn report_created(graph: &str, created: bool) {
    if created {
        println!("  {} {graph}", "created".green());
    } else {
        println!("  {} {graph}", "exists".yellow());
    }
}

fn render_row(row: &[Option<GlobalNode>]) -> String {
    row.iter()
        .map(|value| match value {
            Some(node) => format_term(node),
            None => "-".to_string(),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

fn read_ntriples(path: &Path) -> Result<Vec<[GlobalNode; 3]>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut statements = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (s, p, o) = ntriples::parse_statement(line)
            .with_context(|| format!("{}:{}", path.display(), index + 1))?;
        statements.push([s, p, o]);
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_read_ntriples_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.nt");
        fs::write(
            &path,
            "# header\n<urn:a> <urn:p> <urn:b> .\n\n<urn:b> <urn:p> \"c\" .\n",
        )
        .unwrap();
        let statements = read_ntriples(&path).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0][2], GlobalNode::uri("urn:b"));
    }

    #[test]
    fn test_read_ntriples_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.nt");
        fs::write(&path, "<urn:a> <urn:p> <urn:b> .\n<urn:a> <urn:p>\n").unwrap();
        let err = read_ntriples(&path).unwrap_err();
        assert!(format!("{err}").ends_with(":2"));
    }

    #[test]
    fn test_script_runs_against_database() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("data.nt"), "<urn:a> <urn:p> <urn:b> .\n").unwrap();
        let source = "\
create <urn:g>
load <urn:g> data.nt
insert <urn:g> <urn:b> <urn:p> <urn:c> .
begin
delete <urn:g> <urn:a> <urn:p> <urn:b> .
rollback
ask from <urn:g> where <urn:a> <urn:p> <urn:b>
";
        let lines = script::parse_script(source).unwrap();
        let database = open_database(DatabaseConfig::default()).unwrap();
        let session = database.new_session().unwrap();
        for line in &lines {
            run_line(&session, line, dir.path()).unwrap();
        }
        assert!(session.graph_exists("urn:g").unwrap());
        session.close().unwrap();
        database.close().unwrap();
    }

    #[test]
    fn test_commit_outside_transaction_fails() {
        let lines = script::parse_script("commit").unwrap();
        let database = open_database(DatabaseConfig::default()).unwrap();
        let session = database.new_session().unwrap();
        assert!(run_line(&session, &lines[0], Path::new(".")).is_err());
    }
}
