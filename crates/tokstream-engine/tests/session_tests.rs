//! Integration tests for generation sessions.
//!
//! Validates:
//! - Streaming runs resolve with the concatenated token text
//! - Boundary tokens end runs without contributing text
//! - Supersession and interrupts resolve pending completions with partial text
//! - Backend failures surface through the completion handle
//! - Notification ordering (tokens before the words they complete)
//! - Manual stepping over ranked distributions

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokstream_backend::{one_hot, ScriptedBackend};
use tokstream_engine::*;
use tokstream_vocab::{Token, TokenId, BOS_ID, EOS_ID};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn session(backend: ScriptedBackend) -> GenerationSession<ScriptedBackend> {
    Engine::new(Arc::new(backend)).session().unwrap()
}

fn small() -> ScriptedBackend {
    ScriptedBackend::new(["<pad>", "<s>", "</s>", "a", "b"])
}

fn story() -> ScriptedBackend {
    ScriptedBackend::new(["<pad>", "<s>", "</s>", "Once", " upon", " a", " time", "."])
}

fn greedy() -> GenerationOptions {
    GenerationOptions::greedy().with_seed(11)
}

async fn wait_until(counter: &AtomicUsize, at_least: usize) {
    for _ in 0..2000 {
        if counter.load(Ordering::SeqCst) >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {at_least} events");
}

fn record_tokens(session: &GenerationSession<ScriptedBackend>) -> Arc<Mutex<Vec<Token>>> {
    let tokens = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&tokens);
    session.on_token(move |event| sink.lock().unwrap().push(event.token.clone()));
    tokens
}

fn record_finishes(session: &GenerationSession<ScriptedBackend>) -> Arc<Mutex<Vec<FinishEvent>>> {
    let finishes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&finishes);
    session.on_finish(move |event| sink.lock().unwrap().push(event.clone()));
    finishes
}

// ===========================================================================
// Streaming runs
// ===========================================================================

#[tokio::test]
async fn text_is_concatenation_of_unsuppressed_tokens() {
    let s = session(story().with_token_sequence([3, 4, 5, 6, 7]));
    let tokens = record_tokens(&s);

    let text = s.generate("", greedy()).await.unwrap().await.unwrap();

    let tokens = tokens.lock().unwrap();
    let joined: String = tokens
        .iter()
        .filter(|t| !t.is_boundary())
        .map(|t| t.text.as_str())
        .collect();
    assert_eq!(text, joined);
    assert_eq!(text, "Once upon a time.");
    assert_eq!(tokens.last().map(|t| t.id), Some(EOS_ID));
    assert_eq!(s.accumulated_text(), text);
}

#[tokio::test]
async fn eos_only_run_resolves_empty() {
    let s = session(ScriptedBackend::new(["<pad>", "<s>", "</s>", "H", "e", "l", "o"]));

    let text = s.generate("Hello", greedy()).await.unwrap().await.unwrap();

    assert_eq!(text, "");
    let ids: Vec<TokenId> = s.history().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![BOS_ID, EOS_ID]);
    assert!(s.is_finished());
    assert_eq!(s.state().prompt_tokens, vec![3, 4, 5, 5, 6]);
}

#[tokio::test]
async fn stop_on_boundary_option_is_honored() {
    let s = session(small().with_token_sequence([EOS_ID, 3]).always_token(4));
    let options = greedy().with_stop_on_boundary_token(false).with_max_steps(5);

    let text = s.generate("a", options).await.unwrap().await.unwrap();

    // [BOS, a] + 3 generated positions fill the budget of 5.
    assert_eq!(text, "</s>ab");
    assert_eq!(s.history().len(), 4);
}

#[tokio::test]
async fn finished_is_set_once_per_run() {
    let s = session(small().with_token_sequence([3, 3]));
    let finishes = record_finishes(&s);
    let flips = Arc::new(Mutex::new(Vec::new()));
    {
        let flips = Arc::clone(&flips);
        s.on_token(move |event| flips.lock().unwrap().push(event.token.id == EOS_ID));
    }

    s.generate("", greedy()).await.unwrap().await.unwrap();
    assert!(s.is_finished());
    assert_eq!(*flips.lock().unwrap(), vec![false, false, true]);

    let finishes = finishes.lock().unwrap();
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].reason, FinishReason::Completed);
    assert_eq!(finishes[0].text, "aa");
}

#[tokio::test]
async fn greedy_generation_is_deterministic() {
    let dist = vec![0.0, 0.05, 0.1, 0.5, 0.35];
    let build = || {
        small()
            .with_distributions(vec![dist.clone(), vec![0.0, 0.0, 0.1, 0.3, 0.6]])
            .with_distributions(vec![dist.clone()])
    };

    let mut runs = Vec::new();
    for _ in 0..3 {
        let s = session(build());
        let tokens = record_tokens(&s);
        s.generate("ab", greedy().with_max_steps(6)).await.unwrap().await.unwrap();
        let ids: Vec<TokenId> = tokens.lock().unwrap().iter().map(|t| t.id).collect();
        runs.push(ids);
    }
    assert_eq!(runs[0], vec![3, 4, 3]);
    assert!(runs.iter().all(|r| *r == runs[0]));
}

#[tokio::test]
async fn seeded_sampling_is_reproducible() {
    let dist = vec![0.0, 0.0, 0.05, 0.5, 0.45];
    let options = GenerationOptions::default()
        .with_temperature(0.8)
        .with_seed(1234)
        .with_max_steps(12);

    let first = session(small().always(dist.clone()));
    let a = first.generate("", options.clone()).await.unwrap().await.unwrap();
    let second = session(small().always(dist));
    let b = second.generate("", options).await.unwrap().await.unwrap();
    assert_eq!(a, b);
    assert_eq!(first.history(), second.history());
}

#[tokio::test]
async fn budget_is_passed_to_backend() {
    let backend = Arc::new(small().always_token(3));
    let s = Engine::new(Arc::clone(&backend)).session().unwrap();
    let options = greedy().with_max_steps(4).with_temperature(0.0);

    let text = s.generate("", options).await.unwrap().await.unwrap();

    assert_eq!(text, "aaa");
    assert!(backend.step_params().iter().all(|p| p.max_steps == 4 && p.temperature == 0.0));
    assert_eq!(backend.contexts().last().unwrap(), &vec![BOS_ID, 3, 3]);
}

#[tokio::test]
async fn sessions_keep_their_own_options() {
    let backend = Arc::new(
        small()
            .always_token(3)
            .with_seq_len(20)
            .with_delay(Duration::from_millis(20)),
    );
    let engine = Engine::new(Arc::clone(&backend));
    let first = engine.session().unwrap();
    let second = engine.session().unwrap();

    let handle = first.generate("", greedy().with_max_steps(4)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    second
        .manual_start("", greedy().with_temperature(0.7))
        .await
        .unwrap();

    assert_eq!(handle.await.unwrap(), "aaa");
    assert_eq!(first.history().len(), 4);
    assert_eq!(backend.configured().map(|p| p.max_steps), Some(20));
}

// ===========================================================================
// Words
// ===========================================================================

#[tokio::test]
async fn words_follow_their_tokens() {
    let s = session(story().with_token_sequence([3, 4, 5, 6, 7]));
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let log = Arc::clone(&log);
        s.on_token(move |e| log.lock().unwrap().push(format!("t:{}", e.token.text)));
    }
    {
        let log = Arc::clone(&log);
        s.on_word(move |e| log.lock().unwrap().push(format!("w:{}", e.word)));
    }

    s.generate("", greedy()).await.unwrap().await.unwrap();

    let log = log.lock().unwrap();
    let mut tokens_so_far = String::new();
    let mut words_so_far = String::new();
    for entry in log.iter() {
        if let Some(text) = entry.strip_prefix("t:") {
            tokens_so_far.push_str(text);
        } else if let Some(word) = entry.strip_prefix("w:") {
            words_so_far.push_str(word);
            assert!(tokens_so_far.starts_with(&words_so_far), "word {word:?} before its tokens");
        }
    }
    assert_eq!(
        s.words(),
        vec!["Once", " ", "upon", " ", "a", " ", "time", "."]
    );
}

#[tokio::test]
async fn word_indices_are_sequential() {
    let s = session(story().with_token_sequence([3, 4, 5]));
    let indices = Arc::new(Mutex::new(Vec::new()));
    {
        let indices = Arc::clone(&indices);
        s.on_word(move |e| indices.lock().unwrap().push(e.index));
    }
    s.generate("", greedy()).await.unwrap().await.unwrap();
    let indices = indices.lock().unwrap();
    assert_eq!(*indices, (0..indices.len()).collect::<Vec<_>>());
    assert_eq!(indices.len(), 5);
}

// ===========================================================================
// Supersession, interrupts, failures
// ===========================================================================

#[tokio::test]
async fn new_run_resolves_previous_with_partial_text() {
    let s = session(
        small()
            .always_token(3)
            .with_delay(Duration::from_millis(15)),
    );
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let counter = Arc::clone(&counter);
        s.on_token(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    let finishes = record_finishes(&s);

    let first = s.generate("", greedy()).await.unwrap();
    wait_until(&counter, 2).await;

    let second = s.generate("b", greedy().with_max_steps(4)).await.unwrap();
    let emitted_before = counter.load(Ordering::SeqCst);

    let partial = first.await.unwrap();
    assert_eq!(partial, "a".repeat(emitted_before));

    let text = second.await.unwrap();
    assert_eq!(text, "aa");

    let reasons: Vec<FinishReason> = finishes.lock().unwrap().iter().map(|f| f.reason).collect();
    assert_eq!(reasons, vec![FinishReason::Superseded, FinishReason::Completed]);
}

#[tokio::test]
async fn manual_start_supersedes_streaming_run() {
    let s = session(small().always_token(3).with_delay(Duration::from_millis(10)));
    let handle = s.generate("", greedy()).await.unwrap();

    let ranked = s.manual_start("a", greedy()).await.unwrap();

    assert!(handle.await.is_ok());
    assert_eq!(ranked[0].id, 3);
    assert_eq!(s.phase(), Phase::Running);
}

#[tokio::test]
async fn interrupt_resolves_pending_completion() {
    let s = session(small().always_token(4).with_delay(Duration::from_millis(10)));
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let counter = Arc::clone(&counter);
        s.on_token(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    let finishes = record_finishes(&s);

    let handle = s.generate("", greedy()).await.unwrap();
    wait_until(&counter, 1).await;

    assert!(s.interrupt().await);
    let text = handle.await.unwrap();
    assert!(!text.is_empty());
    assert!(text.chars().all(|c| c == 'b'));
    assert_eq!(s.phase(), Phase::Interrupted);
    assert!(!s.is_finished());
    assert_eq!(finishes.lock().unwrap()[0].reason, FinishReason::Interrupted);

    // Nothing left to stop.
    assert!(!s.interrupt().await);
}

#[tokio::test]
async fn backend_failure_surfaces_through_handle() {
    let s = session(small().always_token(3).with_failure_at(3));
    let finishes = record_finishes(&s);

    let err = s.generate("", greedy()).await.unwrap().await.unwrap_err();

    assert!(matches!(err, GenerateError::BackendError { .. }));
    assert_eq!(err.partial_text(), Some("aa"));
    assert_eq!(s.phase(), Phase::Interrupted);

    let finishes = finishes.lock().unwrap();
    assert_eq!(finishes[0].reason, FinishReason::Failed);
    assert_eq!(finishes[0].text, "aa");
    assert!(finishes[0].error.is_some());
}

#[tokio::test]
async fn failed_run_can_be_restarted() {
    let s = session(small().with_failure_at(1).always_token(3).with_token_sequence([4, EOS_ID]));
    assert!(s.generate("", greedy()).await.unwrap().await.is_err());
    let text = s.generate("", greedy()).await.unwrap().await.unwrap();
    assert_eq!(text, "b");
}

#[tokio::test]
async fn dropping_session_resolves_completion() {
    let s = session(small().always_token(3).with_delay(Duration::from_millis(10)));
    let handle = s.generate("", greedy()).await.unwrap();
    drop(s);
    assert!(handle.await.is_ok());
}

#[tokio::test]
async fn token_stream_yields_run_tokens() {
    let s = session(small().with_token_sequence([3, 4]));
    let stream = s.token_stream();
    s.generate("", greedy()).await.unwrap().await.unwrap();

    let events: Vec<TokenEvent> = stream.collect().await;
    let ids: Vec<TokenId> = events.iter().map(|e| e.token.id).collect();
    assert_eq!(ids, vec![3, 4, EOS_ID]);
    assert_eq!(events[0].position, 1);
}

#[tokio::test]
async fn metrics_recorded_per_run() {
    let hook = LogTelemetry::new();
    let backend = Arc::new(small().with_token_sequence([3, 4]));
    let s = Engine::new(backend)
        .with_telemetry(Arc::new(hook.clone()))
        .session()
        .unwrap();

    s.generate("", greedy()).await.unwrap().await.unwrap();

    assert_eq!(s.last_metrics().unwrap().generated_tokens, 3);
    assert_eq!(hook.last_metrics().unwrap().generated_tokens, 3);
}

#[tokio::test]
async fn failed_runs_record_no_metrics() {
    let hook = LogTelemetry::new();
    let backend = Arc::new(small().with_failure_at(1).with_token_sequence([4, EOS_ID]));
    let s = Engine::new(backend)
        .with_telemetry(Arc::new(hook.clone()))
        .session()
        .unwrap();

    assert!(s.generate("", greedy()).await.unwrap().await.is_err());
    assert!(s.last_metrics().is_none());
    assert!(hook.last_metrics().is_none());

    s.generate("", greedy()).await.unwrap().await.unwrap();
    assert_eq!(s.last_metrics().unwrap().generated_tokens, 2);
}

// ===========================================================================
// Manual stepping
// ===========================================================================

#[tokio::test]
async fn manual_ranked_list_covers_non_padding_ids() {
    let s = session(small().with_distributions([
        vec![0.0, 0.1, 0.2, 0.3, 0.4],
        vec![0.05, 0.1, 0.4, 0.1, 0.35],
    ]));

    let first = s.manual_start("a", greedy()).await.unwrap();
    let ids: Vec<TokenId> = first.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![4, 3, 2, 1]);

    let next = s.manual_next("b").await.unwrap();
    let ids: Vec<TokenId> = next.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![2, 4, 1, 3]);
    assert!(next.windows(2).all(|w| w[0].probability >= w[1].probability));

    let history = s.history();
    assert_eq!(history.last().unwrap(), &Token::new(4, "b", 0.4));
}

#[tokio::test]
async fn manual_next_accepts_every_input_kind() {
    let s = session(small());
    s.manual_start("a", greedy()).await.unwrap();

    s.manual_next(3u32).await.unwrap();
    s.manual_next(Token::new(4, "b", 0.0)).await.unwrap();
    s.manual_next("a").await.unwrap();
    s.manual_next(TokenInput::Text("b".into())).await.unwrap();

    let ids: Vec<TokenId> = s.history().iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![BOS_ID, 3, 3, 4, 3, 4]);
    assert_eq!(s.accumulated_text(), "abab");
}

#[tokio::test]
async fn manual_next_rejects_unknown_text_without_change() {
    let s = session(small());
    s.manual_start("a", greedy()).await.unwrap();
    s.manual_next("b").await.unwrap();
    let before = s.state();

    assert!(matches!(
        s.manual_next("zebra").await,
        Err(GenerateError::InvalidToken(_))
    ));
    assert!(matches!(
        s.manual_next(42u32).await,
        Err(GenerateError::InvalidToken(_))
    ));
    assert_eq!(s.state(), before);
}

#[tokio::test]
async fn manual_mode_ignores_boundary_tokens() {
    let s = session(small());
    s.manual_start("a", greedy().with_max_steps(2)).await.unwrap();
    s.manual_next(EOS_ID).await.unwrap();
    s.manual_next(BOS_ID).await.unwrap();
    s.manual_next("a").await.unwrap();
    assert_eq!(s.phase(), Phase::Running);
    assert!(!s.is_finished());
}

#[tokio::test]
async fn distribution_notifications_match_ranked_lists() {
    let s = session(small().always(one_hot(5, 3)));
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        s.on_distribution(move |e| seen.lock().unwrap().push(e.tokens.clone()));
    }

    let first = s.manual_start("a", greedy()).await.unwrap();
    let second = s.manual_next(3u32).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![first, second]);
}

#[tokio::test]
async fn streaming_after_manual_starts_fresh() {
    let s = session(small().with_token_sequence([4, 4, 3, EOS_ID]));
    s.manual_start("a", greedy()).await.unwrap();
    s.manual_next("b").await.unwrap();

    let text = s.generate("", greedy()).await.unwrap().await.unwrap();
    assert_eq!(text, "a");
    assert_eq!(s.history().first(), Some(&Token::bos()));
    assert!(matches!(
        s.manual_next("a").await,
        Err(GenerateError::ManualNotStarted)
    ));
}
