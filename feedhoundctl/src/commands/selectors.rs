use std::path::PathBuf;

use clap::Subcommand;
use serde::Serialize;

use crate::{AppContext, DisplayFallback, Result};

#[derive(Subcommand, Debug)]
pub enum SelectorsCommands {
    /// Print the effective selector table, learned entries included
    Show,
}

#[derive(Debug, Serialize)]
pub struct SelectorTable {
    pub learned_path: PathBuf,
    pub targets: Vec<SelectorRow>,
}

#[derive(Debug, Serialize)]
pub struct SelectorRow {
    pub target: String,
    /// Set when `[selectors]` in the config replaced the built-in list.
    pub overridden: bool,
    pub candidates: Vec<String>,
}

pub fn show(context: &AppContext) -> Result<SelectorTable> {
    let registry = context.registry()?;
    let config = context.config();
    let targets = registry
        .specs()
        .map(|spec| SelectorRow {
            target: spec.target().to_string(),
            overridden: config.selectors.contains_key(spec.target()),
            candidates: spec.candidates().map(str::to_string).collect(),
        })
        .collect();
    Ok(SelectorTable {
        learned_path: config.learned_selectors_path(),
        targets,
    })
}

impl DisplayFallback for SelectorTable {
    fn display(&self) -> String {
        let mut lines = vec![format!("learned selectors: {}", self.learned_path.display())];
        for row in &self.targets {
            let marker = if row.overridden { " (config)" } else { "" };
            lines.push(format!("{}{marker}", row.target));
            for (index, candidate) in row.candidates.iter().enumerate() {
                lines.push(format!("  {}. {candidate}", index + 1));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cli;
    use clap::Parser;
    use feedhound_core::selectors::{targets, SelectorRegistry};
    use std::fs;

    fn context(dir: &std::path::Path) -> AppContext {
        let fixture = concat!(env!("CARGO_MANIFEST_DIR"), "/../configs/engine.toml");
        let mut cli =
            Cli::try_parse_from(["feedhoundctl", "--config", fixture, "selectors", "show"])
                .unwrap();
        cli.base_dir = Some(dir.to_path_buf());
        AppContext::new(&cli).unwrap()
    }

    #[test]
    fn table_reflects_overrides_and_learned_entries() {
        let temp = tempfile::tempdir().unwrap();
        let context = context(temp.path());

        let mut learned = SelectorRegistry::from_config(context.config()).unwrap();
        learned
            .add_alternative(targets::POST_CONTAINER, "div.userContentWrapper")
            .unwrap();
        let path = context.config().learned_selectors_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        learned.save_learned(&path).unwrap();

        let table = show(&context).unwrap();
        let row = table
            .targets
            .iter()
            .find(|row| row.target == targets::POST_CONTAINER)
            .unwrap();
        assert!(row.overridden);
        assert_eq!(row.candidates[0], "div[aria-posinset]");
        assert!(row.candidates.iter().any(|c| c == "div.userContentWrapper"));

        let close = table
            .targets
            .iter()
            .find(|row| row.target == targets::CLOSE_BUTTON)
            .unwrap();
        assert!(!close.overridden);
        assert!(table.display().contains("post_container (config)"));
    }
}
