//! # Notification Service サーバー
//!
//! 配信リクエストを受け付けてジョブキューに投入する HTTP サーバーと、
//! キューからジョブを取り出してメールを送るワーカープールを 1 プロセスで動かす。
//!
//! ```text
//! HTTP ──▶ Dispatcher ──▶ jobs テーブル ◀── Worker × N ──▶ SMTP
//!                                               │
//!                                               └──▶ receipts テーブル
//! ```
//!
//! ## 環境変数
//!
//! | 変数名 | 必須 | 説明 |
//! |--------|------|------|
//! | `HOST` / `PORT` | No | バインドアドレス（デフォルト: `0.0.0.0:3000`） |
//! | `DATABASE_URL` | **Yes** | PostgreSQL 接続 URL |
//! | `SENDER` | **Yes** | 送信元メールアドレス |
//! | `ENCRYPTION_KEY` | **Yes** | 配信停止トークンの暗号鍵 |
//! | `UAA_HOST` / `UAA_CLIENT_ID` / `UAA_CLIENT_SECRET` | **Yes** | UAA 接続情報 |
//! | `CC_HOST` | **Yes** | Cloud Controller の URL |
//! | `MAIL_BACKEND` | No | `smtp`（デフォルト）または `noop` |
//! | `WORKER_COUNT` / `INSTANCE_INDEX` | No | ワーカー数とインスタンス番号 |
//!
//! 全項目は [`ServiceConfig`] を参照。
//!
//! ## 停止手順
//!
//! Ctrl-C / SIGTERM を受けたら HTTP サーバーを graceful に止め、ワーカーに停止を通知し、
//! 実行中のジョブが終わるのを `SHUTDOWN_GRACE_SECONDS` まで待つ。

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use notifications_domain::{
    clock::{Clock, SystemClock},
    job::RetryPolicy,
    worker::WorkerGenerator,
};
use notifications_infra::{
    Cloak,
    client::{CloudControllerClient, UaaClient},
    cloak::AesGcmCloak,
    db::{self, PgTransactionManager, TransactionManager},
    mail::{MailTransport, NoopMailTransport, SmtpMailTransport},
    repository::{
        JobQueue,
        PostgresJobQueue,
        PostgresReceiptRepository,
        PostgresTemplateLoader,
        ReceiptRepository,
        TemplateLoader,
    },
};
use notifications_service::{
    config::{MailBackend, ServiceConfig},
    handler::{self, JobState, NotifyState},
    usecase::{DeliveryProcessor, Dispatcher, Packager, PackagerSettings, WorkerPool},
};
use notifications_shared::observability::{TracingConfig, init_tracing};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env ファイルを読み込む（存在する場合）
    dotenvy::dotenv().ok();

    init_tracing(TracingConfig::from_env("notifications-service"));

    let config = ServiceConfig::from_env().context("設定の読み込みに失敗しました")?;

    tracing::info!(
        "Notification Service を起動します: {}:{}",
        config.host,
        config.port
    );

    let pool = db::create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("データベース接続に失敗しました")?;
    tracing::info!("データベースに接続しました");

    db::run_migrations(&pool)
        .await
        .context("マイグレーションの実行に失敗しました")?;
    tracing::info!("マイグレーションを適用しました");

    // 依存コンポーネントを初期化
    let uaa = Arc::new(UaaClient::new(
        &config.uaa.host,
        &config.uaa.client_id,
        &config.uaa.client_secret,
    ));
    let cloud_controller = Arc::new(CloudControllerClient::new(&config.cc_host, uaa.clone()));

    let policy = RetryPolicy {
        max_attempts: config.worker.max_attempts,
        lease:        config.worker.lease,
    };
    let queue: Arc<dyn JobQueue> = Arc::new(PostgresJobQueue::new(pool.clone(), policy));
    let receipts: Arc<dyn ReceiptRepository> =
        Arc::new(PostgresReceiptRepository::new(pool.clone()));
    let templates: Arc<dyn TemplateLoader> = Arc::new(PostgresTemplateLoader::new(pool.clone()));
    let tx_manager: Arc<dyn TransactionManager> = Arc::new(PgTransactionManager::new(pool));
    let cloak: Arc<dyn Cloak> = Arc::new(AesGcmCloak::new(&config.packager.encryption_key));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let transport: Arc<dyn MailTransport> = match config.mail.backend {
        MailBackend::Smtp => Arc::new(SmtpMailTransport::new(
            &config.mail.smtp_host,
            config.mail.smtp_port,
        )),
        MailBackend::Noop => Arc::new(NoopMailTransport),
    };
    tracing::info!(backend = %config.mail.backend, "メール送信を設定しました");

    let packager = Packager::new(
        templates,
        cloak,
        clock.clone(),
        PackagerSettings {
            sender:         config.packager.sender.clone(),
            domain:         config.packager.domain.clone(),
            subject_prefix: config.packager.subject_prefix.clone(),
        },
    );
    let processor = Arc::new(DeliveryProcessor::new(
        queue.clone(),
        receipts,
        tx_manager.clone(),
        uaa.clone(),
        uaa.clone(),
        transport,
        packager,
    ));

    // ワーカープールを起動
    let shutdown = CancellationToken::new();
    let worker_pool = WorkerPool::new(
        WorkerGenerator::new(config.worker.count, config.worker.instance_index),
        queue.clone(),
        processor,
        config.worker.poll_interval,
    );
    let workers = worker_pool.spawn(shutdown.clone());

    // ルーター構築
    let notify_state = Arc::new(NotifyState {
        dispatcher: Dispatcher::new(uaa, cloud_controller, queue.clone()),
        tx_manager: tx_manager.clone(),
        clock,
    });
    let job_state = Arc::new(JobState { queue, tx_manager });
    let app = handler::router(notify_state, job_state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("アドレスのパースに失敗しました")?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Notification Service が起動しました: {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    // シグナル以外で serve が終了した場合もワーカーを止める
    shutdown.cancel();
    tracing::info!(workers = workers.len(), "ワーカーの停止を待ちます");
    match tokio::time::timeout(
        config.worker.shutdown_grace,
        futures::future::join_all(workers),
    )
    .await
    {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    tracing::error!("ワーカーが異常終了しました: {}", e);
                }
            }
            tracing::info!("Notification Service を停止しました");
        }
        Err(_) => {
            tracing::warn!(
                grace = ?config.worker.shutdown_grace,
                "ワーカーの停止待ちがタイムアウトしました"
            );
        }
    }

    Ok(())
}

/// Ctrl-C または SIGTERM を待つ
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Ctrl-C ハンドラを登録できません: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("SIGTERM ハンドラを登録できません: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("停止シグナルを受信しました");
}
