//! Preview a participant's assignment without touching storage.

use anyhow::Result;
use clap::Args;
use lessonlab_core::{ParticipantContext, assign};

use crate::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct AssignArgs {
    /// Participant id to assign
    pub id: String,

    /// Print the full context as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: AssignArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    let context = assign(&args.id, config.assignment.item_pool_size);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&context)?);
    } else {
        print!("{}", describe(&context));
    }
    Ok(())
}

fn describe(context: &ParticipantContext) -> String {
    let mut out = String::new();
    out.push_str(&format!("Participant: {}\n", context.participant_id));
    if context.participant_id.is_generated() {
        out.push_str("  (id was malformed; a development id was generated)\n");
    }
    out.push_str(&format!("Condition:   {}\n", context.condition));
    out.push_str(&format!("Lesson item: {}\n", context.items.lesson));
    out.push_str(&format!("Final item:  {}\n", context.items.final_test));
    out.push_str(&format!("Stage:       {}\n", context.current_stage));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_lists_assignment() {
        let context = assign("P0042", 8);
        let text = describe(&context);

        assert!(text.contains("Participant: P0042"));
        assert!(text.contains(&format!("Condition:   {}", context.condition)));
        assert!(text.contains("Stage:       consent"));
        assert!(!text.contains("malformed"));
    }

    #[test]
    fn describe_flags_generated_ids() {
        let context = assign("", 8);
        assert!(describe(&context).contains("malformed"));
    }
}
