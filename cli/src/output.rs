//! Output formatting utilities for CLI commands

use cdxfed_aggregator::source::SourceInfo;
use cdxfed_shared::ErrorMap;
use colored::Colorize;

/// Print error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print info message
pub fn info(msg: &str) {
    eprintln!("{} {}", "ℹ".blue(), msg);
}

/// Print warning message
pub fn warning(msg: &str) {
    eprintln!("{} {}", "⚠".yellow(), msg);
}

/// Report per-source failures that did not stop the query.
pub fn source_errors(errors: &ErrorMap) {
    for (source, message) in errors {
        warning(&format!("{}: {}", source.bold(), message));
    }
}

/// Render the source tree, one source per line, children indented.
pub fn source_tree(sources: &[SourceInfo]) -> String {
    let mut out = String::new();
    write_tree(&mut out, sources, 0);
    out
}

fn write_tree(out: &mut String, sources: &[SourceInfo], depth: usize) {
    for source in sources {
        let breaker = match source.breaker {
            "closed" => source.breaker.green(),
            _ => source.breaker.red(),
        };
        out.push_str(&format!(
            "{}{} {} timeout={}ms breaker={}\n",
            "  ".repeat(depth),
            source.name.bold(),
            format!("({})", source.kind).dimmed(),
            source.timeout_ms,
            breaker,
        ));
        write_tree(out, &source.children, depth + 1);
    }
}
