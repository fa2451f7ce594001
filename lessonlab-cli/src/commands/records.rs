//! Inspect what the storage tiers hold for a participant.

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use lessonlab_core::{ParticipantId, SessionRecord, TieredStore};

use crate::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct RecordsArgs {
    /// Participant id
    pub id: String,

    /// Print records as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: RecordsArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    let participant = ParticipantId::parse(&args.id)
        .with_context(|| format!("invalid participant id {:?}", args.id))?;
    let store = TieredStore::open(&config.storage, ConfigLoader::primary_token().as_deref()).await;

    let records = store.load(&participant).await?;
    let context = store.load_context(&participant).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    match context {
        Some(context) => println!(
            "Participant {} | condition {} | stage {}",
            context.participant_id, context.condition, context.current_stage
        ),
        None => println!("Participant {} has no stored context.", participant),
    }

    if records.is_empty() {
        println!("No records stored.");
        return Ok(());
    }

    println!("{}", records_table(&records));
    Ok(())
}

fn records_table(records: &[SessionRecord]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Item").fg(Color::Cyan),
        Cell::new("Phase").fg(Color::Cyan),
        Cell::new("Condition").fg(Color::Cyan),
        Cell::new("Answer").fg(Color::Cyan),
        Cell::new("Correct").fg(Color::Cyan),
        Cell::new("Turns").fg(Color::Cyan),
        Cell::new("Elapsed").fg(Color::Cyan),
    ]);

    for record in records {
        let correct = match record.is_correct {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        let elapsed = if record.timed_out {
            format!("{:.0}s (timed out)", record.elapsed_seconds)
        } else {
            format!("{:.0}s", record.elapsed_seconds)
        };

        table.add_row(vec![
            Cell::new(record.item_id),
            Cell::new(record.phase.as_str()),
            Cell::new(record.condition),
            Cell::new(record.final_answer.as_deref().unwrap_or("-")),
            Cell::new(correct),
            Cell::new(record.transcript.len()),
            Cell::new(elapsed),
        ]);
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lessonlab_core::{Condition, ItemId, RecordPhase};

    #[test]
    fn table_has_a_row_per_record() {
        let mut lesson = SessionRecord::new(
            ItemId(3),
            "3/4 of 12",
            RecordPhase::Lesson,
            Condition::Group,
            Utc::now(),
        );
        lesson.final_answer = Some("9".to_string());
        lesson.is_correct = Some(true);
        lesson.elapsed_seconds = 184.0;

        let mut final_test = SessionRecord::new(
            ItemId(6),
            "2/5 of 20",
            RecordPhase::FinalTest,
            Condition::Group,
            Utc::now(),
        );
        final_test.timed_out = true;

        let rendered = records_table(&[lesson, final_test]).to_string();

        assert!(rendered.contains("final-test"));
        assert!(rendered.contains("184s"));
        assert!(rendered.contains("timed out"));
        assert!(rendered.contains("group"));
    }
}
