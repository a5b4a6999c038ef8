//! グレースフルシャットダウンの調停。
//!
//! シグナル・クラッシュ・接続失敗・処理完了のいずれが先に起きても、
//! 切断処理は 1 回だけ実行され、終了コードは 1 つに決まる。

use std::fmt;
use std::future::Future;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// シャットダウンの進行状態。Running → Stopping → Disconnected → Exited の順にのみ進む。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
    Disconnected,
    Exited,
}

/// シャットダウンのきっかけ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 終了シグナル（SIGINT / SIGTERM など）
    Signal(String),
    /// クライアントのクラッシュイベント
    Crash(String),
    /// 起動時の接続失敗
    ConnectFailed(String),
    /// 予定した処理の完了
    Completed,
}

impl ShutdownReason {
    /// 異常終了として扱う理由かを判定する。
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Crash(_) | Self::ConnectFailed(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal {name}"),
            Self::Crash(error) => write!(f, "crash: {error}"),
            Self::ConnectFailed(error) => write!(f, "connect failed: {error}"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// シャットダウンの結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub reason: ShutdownReason,
    pub disconnect_ok: bool,
}

impl ShutdownOutcome {
    /// 数値の終了ステータス。切断に成功し、かつ理由が致命的でない場合のみ 0。
    pub fn exit_status(&self) -> u8 {
        if self.disconnect_ok && !self.reason.is_fatal() {
            0
        } else {
            1
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}

#[derive(Debug)]
struct Inner {
    state: ShutdownState,
    reason: Option<ShutdownReason>,
}

/// ShutdownCoordinator はプロセス単位のシャットダウンを 1 回だけ実行する。
/// トリガーは何度呼ばれてもよく、最初の呼び出しだけが有効になる。
pub struct ShutdownCoordinator {
    token: CancellationToken,
    inner: Mutex<Inner>,
    outcome: OnceCell<ShutdownOutcome>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state: ShutdownState::Running,
                reason: None,
            }),
            outcome: OnceCell::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// シャットダウン開始時にキャンセルされるトークン。
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> ShutdownState {
        self.lock().state
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.lock().reason.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// シャットダウンを開始する。最初の呼び出しのみ Stopping へ遷移して true を返す。
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        {
            let mut inner = self.lock();
            if inner.state != ShutdownState::Running {
                info!(
                    reason = %reason,
                    state = ?inner.state,
                    "シャットダウン処理中のため要求を無視します"
                );
                return false;
            }
            inner.state = ShutdownState::Stopping;
            inner.reason = Some(reason.clone());
        }
        if reason.is_fatal() {
            error!(reason = %reason, "シャットダウンを開始します");
        } else {
            info!(reason = %reason, "シャットダウンを開始します");
        }
        self.token.cancel();
        true
    }

    /// シャットダウン開始を待つ。
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// 切断処理を 1 回だけ実行して結果を返す。2 回目以降は disconnect を実行せず、
    /// 最初の結果を返す。トリガーされていない場合は Completed として扱う。
    pub async fn finish<F, E>(&self, disconnect: F) -> ShutdownOutcome
    where
        F: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        self.outcome
            .get_or_init(|| async move {
                if self.is_running() {
                    self.trigger(ShutdownReason::Completed);
                }
                let disconnect_ok = match disconnect.await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "切断に失敗しました");
                        false
                    }
                };
                let reason = {
                    let mut inner = self.lock();
                    inner.state = ShutdownState::Disconnected;
                    inner.reason.clone().unwrap_or(ShutdownReason::Completed)
                };
                let outcome = ShutdownOutcome {
                    reason,
                    disconnect_ok,
                };
                self.lock().state = ShutdownState::Exited;
                info!(
                    reason = %outcome.reason,
                    disconnect_ok,
                    exit_status = outcome.exit_status(),
                    "シャットダウンが完了しました"
                );
                outcome
            })
            .await
            .clone()
    }
}

/// 次の終了シグナルを待ち、シグナル名を返す。
struct SignalListener {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl SignalListener {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "CTRL_C"
    }
}

/// 終了シグナルを監視するタスクを起動する。最初のシグナルでシャットダウンを開始し、
/// その後のシグナルは処理中としてログに残す。ハンドラは戻る前に登録を終える。
pub fn spawn_signal_listener(coordinator: Arc<ShutdownCoordinator>) -> JoinHandle<()> {
    let listener = SignalListener::install();
    tokio::spawn(async move {
        let mut listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "シグナルハンドラの登録に失敗しました");
                return;
            }
        };
        loop {
            let signal = listener.recv().await;
            info!(signal, "シグナルを受信しました");
            coordinator.trigger(ShutdownReason::Signal(signal.to_string()));
        }
    })
}
