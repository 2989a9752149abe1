//! Pattern memory commands: `conductor memory`.

use conductor::conductor_config::ConductorConfig;
use conductor::errors::Result;
use conductor::memory::{MemoryStore, NewMemoryRecord};
use conductor::orchestrator::CommandOutcome;

use super::super::MemoryCommands;
use super::print_outcome;

pub fn cmd_memory(config: &ConductorConfig, command: MemoryCommands) -> Result<()> {
    let store = MemoryStore::open(config.memory_db_path())?;

    let outcome = match command {
        MemoryCommands::Store {
            description,
            category,
            domain,
            signature,
            fix,
            source,
            supersedes,
        } => {
            let mut new = NewMemoryRecord::new(category, domain, description);
            new.signature = signature;
            new.fix = fix;
            new.source_ref = source;
            new.supersedes = supersedes;
            let record = store.store(new)?;
            let mut outcome = CommandOutcome::new(
                "memory store",
                format!("stored {} record #{}", record.category, record.id),
            );
            if let Some(old) = record.supersedes {
                outcome = outcome.line(format!("supersedes #{}", old));
            }
            outcome.details(&record)
        }
        MemoryCommands::Query {
            text,
            domain,
            limit,
        } => {
            let matches = store.query(&text, domain.as_deref(), limit)?;
            CommandOutcome::new("memory query", format!("{} match(es)", matches.len()))
                .lines(matches.iter().map(|m| {
                    format!(
                        "#{} [{}/{}] {} (score {:.2})",
                        m.record.id, m.record.category, m.record.domain, m.record.description, m.score
                    )
                }))
                .details(&matches)
        }
        MemoryCommands::Check { text } => {
            let summary = store.check(&text)?;
            let mut outcome = CommandOutcome::new("memory check", summary.summary.clone());
            if let Some(best) = &summary.best {
                outcome = outcome.line(format!("closest: #{} {}", best.record.id, best.record.description));
                if let Some(fix) = &best.record.fix {
                    outcome = outcome.line(format!("fix: {}", fix));
                }
            }
            outcome.details(&summary)
        }
    };
    print_outcome(&outcome, config.json)?;
    Ok(())
}
