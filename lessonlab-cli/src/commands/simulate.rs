//! Dry run of a whole participant session with canned agents.
//!
//! Walks every stage in order, saving surveys and records to the
//! configured stores, and prints the lesson transcript.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use lessonlab_core::{
    CannedGenerator, ConversationTurn, DialogueError, Experiment, ExperimentConfig,
    FinalTestSubmission, LessonOutcome, LessonSession, SpeakerKind, Stage, SurveyKind,
    TieredStore,
};
use serde_json::json;
use tokio::time::Instant;
use tracing::warn;

use crate::config::ConfigLoader;

const LESSON_ITEM: &str = "A recipe needs 3/4 cup of sugar per batch. How many cups are needed for 12 batches?";
const FINAL_ITEM: &str = "A ribbon is 20 m long. What is 2/5 of its length?";

const STUDENT_LINES: &[&str] = &[
    "I think you multiply 3/4 by 12.",
    "12 divided by 4 is 3, and 3 times 3 is 9.",
    "So the answer should be 9 cups, right?",
    "We could check by adding 3/4 twelve times.",
];

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Participant id (a development id is generated when omitted)
    #[arg(short, long)]
    pub participant: Option<String>,

    /// Number of student messages after the initial answer
    #[arg(short, long, default_value_t = 3)]
    pub messages: usize,

    /// Reveal agent text at the configured speed instead of instantly
    #[arg(long)]
    pub realtime: bool,
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    let mut config = ConfigLoader::load()?;
    if !args.realtime {
        config.dialogue.reveal_chars_per_second = 0.0;
    }
    let store = TieredStore::open(&config.storage, ConfigLoader::primary_token().as_deref()).await;

    let mut exp = Experiment::start(
        config.clone(),
        store,
        Arc::new(CannedGenerator::default()),
        args.participant.as_deref(),
    )
    .await?;
    println!(
        "Participant {} assigned to {} (lesson item {}, final item {})",
        exp.participant(),
        exp.context().condition,
        exp.context().items.lesson,
        exp.context().items.final_test
    );

    exp.advance(Stage::PreSurvey).await?;
    exp.save_survey(
        SurveyKind::Pre,
        BTreeMap::from([("math_confidence".to_string(), json!(3))]),
    )
    .await?;

    exp.advance(Stage::Lesson).await?;
    let started = Instant::now();
    let mut lesson = exp.begin_lesson(LESSON_ITEM, started)?;
    run_lesson(&mut lesson, &config, args.messages).await;

    print_transcript(lesson.transcript());
    let saved = exp
        .complete_lesson(
            lesson,
            LessonOutcome {
                final_answer: Some("9".to_string()),
                is_correct: Some(true),
                timed_out: false,
            },
            Instant::now(),
        )
        .await?;
    println!("Lesson record saved to {} ({} attempts)", saved.tier, saved.attempts);

    exp.advance(Stage::Break).await?;
    exp.advance(Stage::PostSurvey).await?;
    exp.save_survey(
        SurveyKind::Post,
        BTreeMap::from([("enjoyment".to_string(), json!(4))]),
    )
    .await?;

    exp.advance(Stage::FinalTest).await?;
    let saved = exp
        .record_final_test(FinalTestSubmission {
            item_text: FINAL_ITEM.to_string(),
            answer: "8".to_string(),
            work_area: "20 / 5 = 4, 4 * 2 = 8".to_string(),
            is_correct: Some(true),
            elapsed_seconds: 45.0,
            timed_out: false,
        })
        .await?;
    println!("Final test saved to {}", saved.tier);

    exp.advance(Stage::Completed).await?;
    println!("Simulation complete: {} records stored", exp.records().await?.len());
    Ok(())
}

/// Initial answer, then `messages` student turns, letting agents reply.
async fn run_lesson(lesson: &mut LessonSession, config: &ExperimentConfig, messages: usize) {
    // Long enough for every responder to generate and settle.
    let settle = config.dialogue.settle_ceiling() + Duration::from_secs(1);

    if let Err(e) = lesson.submit_initial_answer("9", Instant::now()) {
        warn!(error = %e, "initial answer rejected");
    }
    wait_until_idle(lesson, settle).await;

    for line in STUDENT_LINES.iter().cycle().take(messages) {
        match lesson.submit_message(*line, Instant::now()) {
            Ok(_) => {}
            Err(DialogueError::InputPaused) => {
                // Let the intervention play out, then post.
                wait_until_idle(lesson, settle).await;
                if let Err(e) = lesson.submit_message(*line, Instant::now()) {
                    warn!(error = %e, "message rejected");
                }
            }
            Err(e) => warn!(error = %e, "message rejected"),
        }
        wait_until_idle(lesson, settle).await;
    }
}

/// Tick until no turn is in flight, giving up after `limit`.
async fn wait_until_idle(lesson: &mut LessonSession, limit: Duration) {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        lesson.run_for(Duration::from_millis(100)).await;
        if lesson.scheduler().is_idle() && lesson.input_enabled() {
            return;
        }
    }
    lesson.unstick(Instant::now());
}

fn print_transcript(turns: &[ConversationTurn]) {
    println!();
    for turn in turns {
        let speaker = match (turn.speaker, &turn.agent) {
            (SpeakerKind::System, _) => "problem".to_string(),
            (SpeakerKind::Human, _) => "student".to_string(),
            (SpeakerKind::Agent, Some(agent)) => agent.to_string(),
            (SpeakerKind::Agent, None) => "agent".to_string(),
        };
        let marker = if turn.fallback { " (fallback)" } else { "" };
        println!("[{:>11}]{} {}", speaker, marker, turn.body);
    }
    println!();
}
