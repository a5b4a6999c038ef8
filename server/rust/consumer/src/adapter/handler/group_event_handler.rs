use std::sync::{Arc, Mutex, PoisonError};

use pubsub_messaging::{GroupEvent, GroupMembership};
use pubsub_server_common::{ShutdownCoordinator, ShutdownReason};
use pubsub_telemetry::Metrics;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// GroupEventHandler はグループイベントを受け取るハンドラ。
/// ディスパッチタスク上で同期的に呼ばれるため、ブロックしてはならない。
#[cfg_attr(test, mockall::automock)]
pub trait GroupEventHandler: Send + Sync {
    fn handle(&self, event: &GroupEvent);
}

/// GroupEventDispatcher は起動時に登録したハンドラへ、登録順にイベントを配る。
#[derive(Default)]
pub struct GroupEventDispatcher {
    handlers: Vec<Arc<dyn GroupEventHandler>>,
}

impl GroupEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, handler: Arc<dyn GroupEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn dispatch(&self, event: &GroupEvent) {
        for handler in &self.handlers {
            handler.handle(event);
        }
    }

    /// 受信側を購読してディスパッチを続けるタスクを起動する。
    /// stop がキャンセルされると、受信済みのイベントを配り終えてから終了する。
    pub fn spawn(
        self,
        mut events: broadcast::Receiver<GroupEvent>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = events.recv() => match received {
                        Ok(event) => self.dispatch(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "グループイベントを取りこぼしました");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    () = stop.cancelled() => {
                        while let Ok(event) = events.try_recv() {
                            self.dispatch(&event);
                        }
                        break;
                    }
                }
            }
        })
    }
}

/// LoggingEventHandler はグループイベントをログに出し、リバランス回数を数える。
pub struct LoggingEventHandler {
    group_id: String,
    metrics: Arc<Metrics>,
}

impl LoggingEventHandler {
    pub fn new(group_id: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            group_id: group_id.into(),
            metrics,
        }
    }
}

impl GroupEventHandler for LoggingEventHandler {
    fn handle(&self, event: &GroupEvent) {
        match event {
            GroupEvent::GroupJoin {
                membership,
                partitions,
                duration_ms,
            } => info!(
                event = event.name(),
                duration_ms,
                group_id = %membership.group_id,
                member_id = membership.member_id.as_deref().unwrap_or("-"),
                leader_id = membership.leader_id.as_deref().unwrap_or("-"),
                is_leader = membership.is_leader,
                group_protocol = %membership.group_protocol,
                partitions = ?partitions,
                "GROUP JOIN"
            ),
            GroupEvent::Rebalancing {
                group_id,
                member_id,
            } => {
                self.metrics.record_kafka_rebalance(&self.group_id);
                info!(
                    event = event.name(),
                    group_id = %group_id,
                    member_id = member_id.as_deref().unwrap_or("-"),
                    "REBALANCING"
                );
            }
            GroupEvent::Connect => info!(event = event.name(), "コンシューマーが接続しました"),
            GroupEvent::Disconnect => info!(event = event.name(), "コンシューマーが切断されました"),
            GroupEvent::Crash { error } => {
                error!(event = event.name(), error = %error, "コンシューマーがクラッシュしました");
            }
        }
    }
}

/// MembershipRecorder は直近の GroupJoin で得たメンバー情報を保持する。
#[derive(Default)]
pub struct MembershipRecorder {
    membership: Mutex<Option<GroupMembership>>,
}

impl MembershipRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn membership(&self) -> Option<GroupMembership> {
        self.membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl GroupEventHandler for MembershipRecorder {
    fn handle(&self, event: &GroupEvent) {
        let mut membership = self
            .membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match event {
            GroupEvent::GroupJoin { membership: m, .. } => *membership = Some(m.clone()),
            // リバランス中・切断後のメンバー情報は無効
            GroupEvent::Rebalancing { .. } | GroupEvent::Disconnect => *membership = None,
            GroupEvent::Connect | GroupEvent::Crash { .. } => {}
        }
    }
}

/// ShutdownOnCrash はクラッシュイベントでシャットダウンを開始する。
pub struct ShutdownOnCrash {
    coordinator: Arc<ShutdownCoordinator>,
}

impl ShutdownOnCrash {
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl GroupEventHandler for ShutdownOnCrash {
    fn handle(&self, event: &GroupEvent) {
        if let GroupEvent::Crash { error } = event {
            self.coordinator
                .trigger(ShutdownReason::Crash(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pubsub_server_common::ShutdownState;

    fn join(member: &str) -> GroupEvent {
        GroupEvent::GroupJoin {
            membership: GroupMembership {
                group_id: "test-group".to_string(),
                member_id: Some(member.to_string()),
                leader_id: Some(member.to_string()),
                is_leader: true,
                group_protocol: "RoundRobinAssigner".to_string(),
            },
            partitions: vec![0, 1, 2],
            duration_ms: 12,
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut first = MockGroupEventHandler::new();
        let o = order.clone();
        first
            .expect_handle()
            .times(1)
            .returning(move |_| o.lock().unwrap().push("first"));
        let mut second = MockGroupEventHandler::new();
        let o = order.clone();
        second
            .expect_handle()
            .times(1)
            .returning(move |_| o.lock().unwrap().push("second"));

        let dispatcher = GroupEventDispatcher::new()
            .register(Arc::new(first))
            .register(Arc::new(second));
        dispatcher.dispatch(&GroupEvent::Connect);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_membership_recorder() {
        let recorder = MembershipRecorder::new();
        assert!(recorder.membership().is_none());

        recorder.handle(&join("consumer-1"));
        let membership = recorder.membership().unwrap();
        assert_eq!(membership.member_id.as_deref(), Some("consumer-1"));
        assert!(membership.is_leader);

        recorder.handle(&GroupEvent::Rebalancing {
            group_id: "test-group".to_string(),
            member_id: None,
        });
        assert!(recorder.membership().is_none());
    }

    #[test]
    fn test_crash_triggers_shutdown() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let handler = ShutdownOnCrash::new(coordinator.clone());

        handler.handle(&GroupEvent::Connect);
        assert!(coordinator.is_running());

        handler.handle(&GroupEvent::Crash {
            error: "fatal".to_string(),
        });
        assert_eq!(coordinator.state(), ShutdownState::Stopping);
        assert_eq!(
            coordinator.reason(),
            Some(ShutdownReason::Crash("fatal".to_string()))
        );
    }

    #[test]
    fn test_rebalance_counted() {
        let metrics = Arc::new(Metrics::new("pubsub-consumer").unwrap());
        let handler = LoggingEventHandler::new("test-group", metrics.clone());
        handler.handle(&GroupEvent::Rebalancing {
            group_id: "test-group".to_string(),
            member_id: None,
        });
        handler.handle(&join("consumer-1"));
        let rebalances = metrics
            .kafka_rebalances_total
            .with_label_values(&["test-group"])
            .get();
        assert_eq!(rebalances, 1);
    }

    #[tokio::test]
    async fn test_spawned_dispatcher_drains_on_stop() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(MembershipRecorder::new());
        let stop = CancellationToken::new();
        let task = GroupEventDispatcher::new()
            .register(recorder.clone())
            .spawn(rx, stop.clone());

        tx.send(join("consumer-1")).unwrap();
        stop.cancel();
        task.await.unwrap();
        assert!(recorder.membership().is_some());
    }
}
