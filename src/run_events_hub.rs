//! C5: per-run authoritative step state plus ordered, replayable event
//! emission. Transport-agnostic; WebSocket delivery is C6's concern.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::{
    RunEvent, RunStatus, RunSummary, Snapshot, SourceFlags, StepState, StepStatus,
};

const BUFFER_CAPACITY: usize = 200;

pub type RunCallback = Arc<dyn Fn(RunEvent) + Send + Sync>;

struct Subscriber {
    id: Uuid,
    callback: RunCallback,
}

struct RunState {
    seq: AtomicU64,
    total_steps: AtomicU32,
    steps: Mutex<Vec<StepState>>,
    buffer: Mutex<VecDeque<RunEvent>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl RunState {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            total_steps: AtomicU32::new(0),
            steps: Mutex::new(Vec::new()),
            buffer: Mutex::new(VecDeque::with_capacity(BUFFER_CAPACITY)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn step_mut<F: FnOnce(&mut StepState)>(&self, step_id: &str, f: F) {
        let mut steps = self.steps.lock().unwrap();
        if let Some(step) = steps.iter_mut().find(|s| s.step_id == step_id) {
            f(step);
        }
    }
}

/// Per-run-id pub/sub over step/run events, keyed the same way the Log Hub
/// keys log records: a concurrent map owned exclusively by this hub.
pub struct RunEventsHub {
    runs: DashMap<String, Arc<RunState>>,
}

impl RunEventsHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            runs: DashMap::new(),
        })
    }

    pub fn ensure_run(&self, run_id: &str) -> Arc<RunState> {
        self.runs
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(RunState::new()))
            .clone()
    }

    pub fn subscribe(&self, run_id: &str, callback: RunCallback) -> Uuid {
        let state = self.ensure_run(run_id);
        let id = Uuid::new_v4();
        state.subscribers.lock().unwrap().push(Subscriber { id, callback });
        id
    }

    pub fn unsubscribe(&self, run_id: &str, id: Uuid) {
        if let Some(state) = self.runs.get(run_id) {
            state.subscribers.lock().unwrap().retain(|s| s.id != id);
        }
    }

    pub fn build_snapshot(&self, run_id: &str) -> Snapshot {
        let state = self.ensure_run(run_id);
        let steps = state.steps.lock().unwrap();
        let total_steps = state.total_steps.load(Ordering::SeqCst);
        let completed_steps = steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count() as u32;
        let failed_steps = steps
            .iter()
            .filter(|s| s.status == StepStatus::Fail)
            .count() as u32;
        let status = if failed_steps > 0 {
            RunStatus::Fail
        } else if total_steps > 0 && completed_steps >= total_steps {
            RunStatus::Success
        } else {
            RunStatus::Running
        };
        Snapshot {
            frame_type: "Snapshot",
            schema_version: 1,
            run_id: run_id.to_string(),
            seq: state.seq.load(Ordering::SeqCst),
            ts: Utc::now().timestamp_millis(),
            summary: RunSummary {
                status,
                total_steps,
                completed_steps,
                failed_steps,
            },
            steps: steps.clone(),
        }
    }

    pub fn get_buffered_events(&self, run_id: &str) -> Vec<RunEvent> {
        let state = self.ensure_run(run_id);
        state.buffer.lock().unwrap().iter().cloned().collect()
    }

    pub fn run_started(&self, run_id: &str) {
        self.emit(run_id, |run_id, seq, ts| RunEvent::RunStarted {
            run_id,
            seq,
            ts,
        });
    }

    pub fn run_ended(&self, run_id: &str, status: RunStatus) {
        self.emit(run_id, move |run_id, seq, ts| RunEvent::RunEnded {
            run_id,
            seq,
            ts,
            status,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn step_started(
        &self,
        run_id: &str,
        step_id: &str,
        step_index: u32,
        total_steps: u32,
        title: &str,
        static_step_key: &str,
    ) {
        let state = self.ensure_run(run_id);
        state.total_steps.store(total_steps, Ordering::SeqCst);
        {
            let mut steps = state.steps.lock().unwrap();
            let new_step = StepState {
                step_id: step_id.to_string(),
                static_step_key: static_step_key.to_string(),
                step_index,
                total_steps,
                title: title.to_string(),
                status: StepStatus::Running,
                source_flags: SourceFlags {
                    workflow_use: true,
                    browser_use: false,
                },
            };
            if let Some(existing) = steps.iter_mut().find(|s| s.step_id == step_id) {
                *existing = new_step;
            } else {
                steps.push(new_step);
            }
        }
        let step_id = step_id.to_string();
        let step_index = step_index;
        let title = title.to_string();
        let static_step_key = static_step_key.to_string();
        self.emit(run_id, move |run_id, seq, ts| RunEvent::StepStarted {
            run_id,
            seq,
            ts,
            step_id,
            step_index,
            total_steps,
            title,
            static_step_key,
        });
    }

    pub fn step_finished_success(&self, run_id: &str, step_id: &str) {
        let state = self.ensure_run(run_id);
        state.step_mut(step_id, |s| s.status = StepStatus::Success);
        let step_id = step_id.to_string();
        self.emit(run_id, move |run_id, seq, ts| {
            RunEvent::StepFinishedSuccess {
                run_id,
                seq,
                ts,
                step_id,
                status: "success",
            }
        });
    }

    pub fn step_finished_fail(&self, run_id: &str, step_id: &str) {
        let state = self.ensure_run(run_id);
        state.step_mut(step_id, |s| s.status = StepStatus::Fail);
        let step_id = step_id.to_string();
        self.emit(run_id, move |run_id, seq, ts| RunEvent::StepFinishedFail {
            run_id,
            seq,
            ts,
            step_id,
            status: "fail",
        });
    }

    pub fn fallback_started(
        &self,
        run_id: &str,
        step_id: &str,
        attempt: u32,
        max_attempts: u32,
        session_id: &str,
    ) {
        let state = self.ensure_run(run_id);
        state.step_mut(step_id, |s| {
            s.status = StepStatus::AiFallback;
            s.source_flags.browser_use = true;
        });
        let step_id = step_id.to_string();
        let session_id = session_id.to_string();
        self.emit(run_id, move |run_id, seq, ts| RunEvent::FallbackStarted {
            run_id,
            seq,
            ts,
            step_id,
            attempt,
            max_attempts,
            session_id,
        });
    }

    pub fn fallback_retry_progress(
        &self,
        run_id: &str,
        step_id: &str,
        attempt: u32,
        max_attempts: u32,
        session_id: &str,
    ) {
        let step_id = step_id.to_string();
        let session_id = session_id.to_string();
        self.emit(run_id, move |run_id, seq, ts| {
            RunEvent::FallbackRetryProgress {
                run_id,
                seq,
                ts,
                step_id,
                attempt,
                max_attempts,
                session_id,
            }
        });
    }

    /// Alias of `step_finished_success`, matching the source's naming for
    /// the fallback path.
    pub fn fallback_finished_success(&self, run_id: &str, step_id: &str) {
        self.step_finished_success(run_id, step_id);
    }

    pub fn fallback_finished_fail(
        &self,
        run_id: &str,
        step_id: &str,
        attempt: u32,
        max_attempts: u32,
        session_id: &str,
    ) {
        let state = self.ensure_run(run_id);
        state.step_mut(step_id, |s| s.status = StepStatus::Fail);
        let step_id = step_id.to_string();
        let session_id = session_id.to_string();
        self.emit(run_id, move |run_id, seq, ts| {
            RunEvent::FallbackFinishedFail {
                run_id,
                seq,
                ts,
                step_id,
                attempt,
                max_attempts,
                session_id,
            }
        });
    }

    fn emit<F>(&self, run_id: &str, build: F)
    where
        F: FnOnce(String, u64, i64) -> RunEvent,
    {
        let state = self.ensure_run(run_id);
        let seq = state.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let ts = Utc::now().timestamp_millis();
        let event = build(run_id.to_string(), seq, ts);

        {
            let mut buffer = state.buffer.lock().unwrap();
            if buffer.len() >= BUFFER_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        let callbacks: Vec<RunCallback> = state
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.callback.clone())
            .collect();
        for callback in callbacks {
            let event = event.clone();
            tokio::spawn(async move {
                let result =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
                if result.is_err() {
                    tracing::warn!("run event subscriber callback panicked");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[tokio::test]
    async fn snapshot_then_step_finished_matches_documented_scenario() {
        let hub = RunEventsHub::new();
        hub.step_started("r-1", "s-1", 0, 2, "Open page", "KEY_A");

        let snapshot = hub.build_snapshot("r-1");
        assert_eq!(snapshot.seq, 1);
        assert_eq!(snapshot.summary.total_steps, 2);
        assert_eq!(snapshot.summary.completed_steps, 0);
        assert_eq!(snapshot.steps[0].status, StepStatus::Running);

        let (tx, rx) = mpsc::channel();
        hub.subscribe(
            "r-1",
            Arc::new(move |event: RunEvent| {
                let _ = tx.send(event);
            }),
        );
        hub.step_finished_success("r-1", "s-1");
        // give the fire-and-forget task a chance to run
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let event = rx.try_recv().expect("expected a delivered event");
        match event {
            RunEvent::StepFinishedSuccess {
                step_id, status, seq, run_id, ..
            } => {
                assert_eq!(step_id, "s-1");
                assert_eq!(status, "success");
                assert_eq!(seq, 2);
                assert_eq!(run_id, "r-1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn seq_is_strictly_monotonic_and_buffer_is_bounded() {
        let hub = RunEventsHub::new();
        for i in 0..(BUFFER_CAPACITY + 10) {
            hub.step_started("r-2", &format!("s-{i}"), i as u32, 1, "t", "k");
        }
        let buffered = hub.get_buffered_events("r-2");
        assert_eq!(buffered.len(), BUFFER_CAPACITY);
        let mut last = 0;
        for event in &buffered {
            assert!(event.seq() > last);
            last = event.seq();
        }
    }

    #[test]
    fn run_status_reflects_failures_and_completion() {
        let hub = RunEventsHub::new();
        hub.step_started("r-3", "a", 0, 2, "a", "A");
        hub.step_started("r-3", "b", 1, 2, "b", "B");
        hub.step_finished_success("r-3", "a");
        hub.step_finished_fail("r-3", "b");
        let snapshot = hub.build_snapshot("r-3");
        assert_eq!(snapshot.summary.status, RunStatus::Fail);
    }
}
