use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

/// GroupMembership はグループ参加時にブローカーから割り当てられたメンバー情報のスナップショット。
/// クライアントからは読み取り専用で、リバランスのたびに作り直される。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMembership {
    pub group_id: String,
    /// クライアントライブラリが公開しない場合は None
    pub member_id: Option<String>,
    pub leader_id: Option<String>,
    pub is_leader: bool,
    /// 割り当てプロトコル（例: "RoundRobinAssigner", "cooperative"）
    pub group_protocol: String,
}

/// GroupEvent はコンシューマーグループのライフサイクルイベント。
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    /// グループ参加完了。partitions はブローカーが通知した割り当て
    GroupJoin {
        membership: GroupMembership,
        partitions: Vec<i32>,
        duration_ms: u64,
    },
    /// リバランス開始。以前の世代で取得したバッチは stale になる
    Rebalancing {
        group_id: String,
        member_id: Option<String>,
    },
    Connect,
    Disconnect,
    /// 回復不能なクライアントエラー
    Crash { error: String },
}

impl GroupEvent {
    /// ログ用のイベント名を返す。
    pub fn name(&self) -> &'static str {
        match self {
            Self::GroupJoin { .. } => "group_join",
            Self::Rebalancing { .. } => "rebalancing",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Crash { .. } => "crash",
        }
    }
}

/// AssignedPartitions は現在の世代で処理したパーティション集合を追跡する。
/// バッチ処理経路からのみ更新される。
#[derive(Debug, Default)]
pub struct AssignedPartitions {
    generation: Option<u64>,
    partitions: BTreeSet<i32>,
}

impl AssignedPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// バッチのパーティションを記録する。世代が変わっていれば集合を作り直す。
    /// 現在の世代で初めて見たパーティションであれば、更新後の集合（昇順）を返す。
    pub fn observe(&mut self, partition: i32, generation: u64) -> Option<Vec<i32>> {
        if self.generation != Some(generation) {
            self.generation = Some(generation);
            self.partitions.clear();
        }
        if self.partitions.insert(partition) {
            Some(self.snapshot())
        } else {
            None
        }
    }

    /// 現在の集合を昇順で返す。
    pub fn snapshot(&self) -> Vec<i32> {
        self.partitions.iter().copied().collect()
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }
}

impl fmt::Display for AssignedPartitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.partitions.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", joined.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_first_time_returns_sorted_set() {
        let mut assigned = AssignedPartitions::new();
        assert_eq!(assigned.observe(2, 1), Some(vec![2]));
        assert_eq!(assigned.observe(0, 1), Some(vec![0, 2]));
        assert_eq!(assigned.observe(1, 1), Some(vec![0, 1, 2]));
        assert_eq!(assigned.to_string(), "[0, 1, 2]");
    }

    #[test]
    fn test_observe_known_partition_returns_none() {
        let mut assigned = AssignedPartitions::new();
        assigned.observe(0, 1);
        assert_eq!(assigned.observe(0, 1), None);
    }

    #[test]
    fn test_new_generation_recalculates() {
        let mut assigned = AssignedPartitions::new();
        assigned.observe(0, 1);
        assigned.observe(1, 1);
        assigned.observe(2, 1);

        // リバランス後は割り当てが作り直される
        assert_eq!(assigned.observe(1, 2), Some(vec![1]));
        assert_eq!(assigned.generation(), Some(2));
        assert_eq!(assigned.snapshot(), vec![1]);
    }

    #[test]
    fn test_empty_display() {
        assert_eq!(AssignedPartitions::new().to_string(), "[]");
    }

    #[test]
    fn test_event_names() {
        assert_eq!(GroupEvent::Connect.name(), "connect");
        assert_eq!(
            GroupEvent::Crash {
                error: "boom".to_string()
            }
            .name(),
            "crash"
        );
    }
}
