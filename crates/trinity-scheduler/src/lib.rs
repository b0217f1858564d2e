#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-scheduler** – Scheduler (§4.7).
//!
//! A tick loop (default every 15s) evaluates every enabled [`Schedule`]
//! against the current time and, when due, admits a chat execution against
//! the owning agent. A fire that cannot be admitted (autonomy off, the
//! fleet paused, the agent not running, or the agent's queue already deep)
//! is still recorded, as an `alert` activity with a `skipped_reason`
//! payload field, rather than vanishing silently — kept distinct from
//! `schedule_fired` so a query for genuine fires never sees a suppressed
//! tick.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use trinity_execution::{ChatRequest, ExecutionEngine};
use trinity_journal::ActivityJournal;
use trinity_store_core::RecordStore;
use trinity_types::{ActivityKind, AgentName, LifecycleState, Schedule, ScheduleTrigger, Severity};
use uuid::Uuid;

/// Default interval between tick evaluations.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(15);
/// A fire is skipped once an agent's pending-admission count exceeds this.
pub const MAX_QUEUE_DEPTH: usize = 3;
/// Settings key gating all schedule admission fleet-wide.
pub const FLEET_PAUSE_KEY: &str = "schedules_paused";

/// Evaluates schedules and admits chat executions when they come due.
pub struct Scheduler {
    store: Arc<dyn RecordStore>,
    execution: Arc<ExecutionEngine>,
    journal: Arc<ActivityJournal>,
    tick_interval: Duration,
    last_eval: DashMap<Uuid, chrono::DateTime<Utc>>,
    queue_depth: DashMap<AgentName, Arc<AtomicUsize>>,
}

impl Scheduler {
    /// Construct a scheduler with the default tick interval.
    pub fn new(
        store: Arc<dyn RecordStore>,
        execution: Arc<ExecutionEngine>,
        journal: Arc<ActivityJournal>,
    ) -> Self {
        Self::with_interval(store, execution, journal, DEFAULT_TICK_INTERVAL)
    }

    /// Construct a scheduler with an explicit tick interval, for tests.
    pub fn with_interval(
        store: Arc<dyn RecordStore>,
        execution: Arc<ExecutionEngine>,
        journal: Arc<ActivityJournal>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            execution,
            journal,
            tick_interval,
            last_eval: DashMap::new(),
            queue_depth: DashMap::new(),
        }
    }

    /// Run the tick loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Evaluate every enabled schedule once. Exposed directly for tests that
    /// don't want to wait on the tick interval.
    #[instrument(skip(self))]
    pub async fn tick(&self) {
        let now = Utc::now();
        let mut due = Vec::new();
        let schedules = match self.store.list_schedules().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to list schedules");
                return;
            }
        };
        for schedule in schedules {
            if !schedule.enabled {
                continue;
            }
            if self.is_due(&schedule, now) {
                due.push(schedule);
            }
        }
        due.sort_by_key(|s| s.id);
        for schedule in due {
            self.fire(schedule).await;
        }
    }

    fn is_due(&self, schedule: &Schedule, now: chrono::DateTime<Utc>) -> bool {
        match &schedule.trigger {
            ScheduleTrigger::OneShot { at } => *at <= now,
            ScheduleTrigger::Cron { expression, timezone } => {
                self.is_cron_due(schedule.id, expression, timezone, now)
            }
        }
    }

    fn is_cron_due(&self, schedule_id: Uuid, expression: &str, timezone: &str, now: chrono::DateTime<Utc>) -> bool {
        let parsed = match cron::Schedule::from_str(expression) {
            Ok(s) => s,
            Err(e) => {
                warn!(%schedule_id, error = %e, "invalid cron expression");
                return false;
            }
        };
        let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
        let default_last = now - chrono::Duration::from_std(self.tick_interval).unwrap_or_default();
        let last = self
            .last_eval
            .get(&schedule_id)
            .map(|r| *r)
            .unwrap_or(default_last);

        let last_tz = last.with_timezone(&tz);
        let now_tz = now.with_timezone(&tz);
        let due = parsed.after(&last_tz).take_while(|event| *event <= now_tz).next().is_some();
        self.last_eval.insert(schedule_id, now);
        due
    }

    fn queue_counter(&self, agent_name: &AgentName) -> Arc<AtomicUsize> {
        self.queue_depth
            .entry(agent_name.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    async fn fleet_paused(&self) -> bool {
        matches!(
            self.store.get_setting(FLEET_PAUSE_KEY).await,
            Ok(Some(v)) if v == "true"
        )
    }

    async fn skip_reason(&self, schedule: &Schedule) -> Option<&'static str> {
        if self.fleet_paused().await {
            return Some("fleet_paused");
        }
        let agent = match self.store.get_agent(&schedule.agent_name).await {
            Ok(Some(agent)) => agent,
            _ => return Some("not_running"),
        };
        if !agent.autonomy {
            return Some("autonomy_disabled");
        }
        if agent.state != LifecycleState::Running {
            return Some("not_running");
        }
        let counter = self.queue_counter(&schedule.agent_name);
        if counter.load(Ordering::SeqCst) > MAX_QUEUE_DEPTH {
            return Some("queue_depth");
        }
        None
    }

    async fn fire(&self, schedule: Schedule) {
        if matches!(schedule.trigger, ScheduleTrigger::OneShot { .. }) {
            let _ = self.store.delete_schedule(&schedule.id).await;
        }

        let skip = self.skip_reason(&schedule).await;
        let mut payload = HashMap::new();
        payload.insert("schedule_id", schedule.id.to_string());
        if let Some(reason) = skip {
            payload.insert("skipped_reason", reason.to_string());
            let _ = self
                .journal
                .record(
                    schedule.agent_name.clone(),
                    ActivityKind::Alert,
                    Severity::Info,
                    None,
                    None,
                    serde_json::to_value(&payload).unwrap_or_default(),
                )
                .await;
            return;
        }

        let _ = self
            .journal
            .record(
                schedule.agent_name.clone(),
                ActivityKind::ScheduleFired,
                Severity::Info,
                None,
                None,
                serde_json::to_value(&payload).unwrap_or_default(),
            )
            .await;

        let counter = self.queue_counter(&schedule.agent_name);
        counter.fetch_add(1, Ordering::SeqCst);
        let execution = self.execution.clone();
        let agent_name = schedule.agent_name.clone();
        let initiator = schedule.owner_principal.to_string();
        let message = schedule.message.clone();
        let schedule_id = schedule.id;
        tokio::spawn(async move {
            let _ = execution
                .chat(ChatRequest {
                    agent_name,
                    trigger: trinity_types::ExecutionTrigger::Scheduled { schedule_id },
                    initiator,
                    message,
                    resume_session_id: None,
                    deadline: None,
                    cancel: CancellationToken::new(),
                })
                .await;
            counter.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trinity_container::SimulatedContainerController;
    use trinity_store_memory::InMemoryStore;
    use trinity_types::{Agent, PrincipalId, ResourceLimits, RuntimeKind, SharedFolderConfig, TemplateRef};

    fn running_agent(name: &str, autonomy: bool) -> Agent {
        Agent {
            name: AgentName::new(name).unwrap(),
            template_ref: TemplateRef::parse("local:base").unwrap(),
            owner: PrincipalId::new("alice").unwrap(),
            sharing: vec![],
            resource_limits: ResourceLimits::default(),
            runtime_kind: RuntimeKind::ClaudeCode,
            model: "claude-sonnet-4".to_string(),
            autonomy,
            full_capabilities: false,
            state: LifecycleState::Running,
            system_protected: false,
            shared_folders: SharedFolderConfig::default(),
            container_id: Some("sim-fixed".to_string()),
            port: Some(2290),
            created_at: Utc::now(),
            last_started_at: None,
        }
    }

    async fn scheduler_with_agent(autonomy: bool) -> (Scheduler, Arc<InMemoryStore>, AgentName) {
        let store = Arc::new(InMemoryStore::new());
        let controller = Arc::new(SimulatedContainerController::new());
        let journal = Arc::new(ActivityJournal::new(store.clone()));
        let execution = Arc::new(ExecutionEngine::new(store.clone(), controller, journal.clone()));
        let agent = running_agent("echo", autonomy);
        let agent_name = agent.name.clone();
        store.insert_agent(agent).await.unwrap();
        (
            Scheduler::with_interval(store.clone(), execution, journal, Duration::from_secs(15)),
            store,
            agent_name,
        )
    }

    #[tokio::test]
    async fn autonomy_disabled_schedule_is_skipped_not_silently_dropped() {
        let (scheduler, store, agent_name) = scheduler_with_agent(false).await;
        let schedule = Schedule {
            id: Uuid::new_v4(),
            agent_name: agent_name.clone(),
            trigger: ScheduleTrigger::OneShot { at: Utc::now() },
            message: "ping".to_string(),
            enabled: true,
            owner_principal: PrincipalId::new("alice").unwrap(),
        };
        store.put_schedule(schedule).await.unwrap();

        scheduler.tick().await;

        let activity = store
            .query_activity(trinity_store_core::ActivityQuery {
                agent_name: Some(agent_name.clone()),
                kinds: Some(vec![ActivityKind::Alert]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(
            activity[0].payload.get("skipped_reason").and_then(|v| v.as_str()),
            Some("autonomy_disabled")
        );

        let fired = store
            .query_activity(trinity_store_core::ActivityQuery {
                agent_name: Some(agent_name),
                kinds: Some(vec![ActivityKind::ScheduleFired]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn one_shot_schedule_is_consumed_after_firing() {
        let (scheduler, store, agent_name) = scheduler_with_agent(true).await;
        let schedule_id = Uuid::new_v4();
        let schedule = Schedule {
            id: schedule_id,
            agent_name,
            trigger: ScheduleTrigger::OneShot { at: Utc::now() },
            message: "ping".to_string(),
            enabled: true,
            owner_principal: PrincipalId::new("alice").unwrap(),
        };
        store.put_schedule(schedule).await.unwrap();

        scheduler.tick().await;

        assert!(store.get_schedule(&schedule_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fleet_pause_skips_every_schedule() {
        let (scheduler, store, agent_name) = scheduler_with_agent(true).await;
        store
            .set_setting(FLEET_PAUSE_KEY.to_string(), "true".to_string())
            .await
            .unwrap();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            agent_name: agent_name.clone(),
            trigger: ScheduleTrigger::OneShot { at: Utc::now() },
            message: "ping".to_string(),
            enabled: true,
            owner_principal: PrincipalId::new("alice").unwrap(),
        };
        store.put_schedule(schedule).await.unwrap();

        scheduler.tick().await;

        let activity = store
            .query_activity(trinity_store_core::ActivityQuery {
                agent_name: Some(agent_name.clone()),
                kinds: Some(vec![ActivityKind::Alert]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            activity[0].payload.get("skipped_reason").and_then(|v| v.as_str()),
            Some("fleet_paused")
        );

        let fired = store
            .query_activity(trinity_store_core::ActivityQuery {
                agent_name: Some(agent_name),
                kinds: Some(vec![ActivityKind::ScheduleFired]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(fired.is_empty());
    }
}
