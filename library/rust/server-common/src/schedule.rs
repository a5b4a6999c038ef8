use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// PeriodicTask は一定間隔でコールバックを実行する周期タスク。
/// 最初の実行は 1 周期後。トークンのキャンセルかコールバックの Break で停止する。
pub struct PeriodicTask {
    period: Duration,
    cancel_token: CancellationToken,
}

impl PeriodicTask {
    pub fn new(period: Duration, cancel_token: CancellationToken) -> Self {
        Self {
            period,
            cancel_token,
        }
    }

    /// 実行を打ち切る。実行中のコールバックは完了まで待たれる。
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// 停止するまでコールバックを周期実行し、実行回数を返す。
    pub async fn run<F, Fut>(&self, mut tick: F) -> u64
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ControlFlow<()>>,
    {
        let period = self.period.max(Duration::from_millis(1));
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ticks = 0;
        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    ticks += 1;
                    if tick().await.is_break() {
                        break;
                    }
                }
            }
        }
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_period() {
        let task = PeriodicTask::new(Duration::from_millis(1000), CancellationToken::new());
        let started = Instant::now();
        let mut fired_at = None;
        task.run(|| {
            fired_at = Some(started.elapsed());
            async { ControlFlow::Break(()) }
        })
        .await;
        assert_eq!(fired_at, Some(Duration::from_millis(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_stops_after_n_ticks() {
        let task = PeriodicTask::new(Duration::from_millis(10), CancellationToken::new());
        let mut remaining = 5;
        let ticks = task
            .run(|| {
                remaining -= 1;
                let flow = if remaining == 0 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                };
                async move { flow }
            })
            .await;
        assert_eq!(ticks, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_loop() {
        let token = CancellationToken::new();
        let task = PeriodicTask::new(Duration::from_millis(100), token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            token.cancel();
        });
        let ticks = task.run(|| async { ControlFlow::Continue(()) }).await;
        canceller.await.unwrap();
        assert_eq!(ticks, 3);
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let task = PeriodicTask::new(Duration::from_millis(10), CancellationToken::new());
        task.stop();
        let ticks = task.run(|| async { ControlFlow::Continue(()) }).await;
        assert_eq!(ticks, 0);
    }
}
