//! # ワーカープール
//!
//! インスタンスごとに固定数のワーカーを起動し、ジョブキューからジョブを予約して配信する。
//!
//! ## 設計方針
//!
//! - **グローバル ID**: ワーカー ID は [`WorkerGenerator`] がインスタンス番号から算出し、
//!   複数インスタンス間で調整なしに衝突しない
//! - **協調はキューのみ**: ワーカー同士は状態を共有せず、キューの原子的な予約だけで排他する
//! - **停止は配信の合間でのみ観測**: [`CancellationToken`] はループ先頭と待機中にだけ確認し、
//!   配信中のジョブは最後まで実行する
//! - **空振り・予約エラー時は待機**: キューが空か予約に失敗したら `poll_interval` だけ待つ
//! - **リースを失ったら結果を捨てる**: 処理中にリースが切れて他のワーカーが回収したジョブは、
//!   完了も失敗も記録せずに手放す

use std::{sync::Arc, time::Duration};

use notifications_domain::{
    job::{Job, JobStatus},
    worker::{WorkerGenerator, WorkerId},
};
use notifications_infra::{InfraError, repository::JobQueue};
use notifications_shared::{
    event_log::{error, event},
    log_business_event,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::delivery::{DeliveryError, DeliveryProcessor};

/// ワーカー 1 つ分
pub struct Worker {
    id:            WorkerId,
    queue:         Arc<dyn JobQueue>,
    processor:     Arc<DeliveryProcessor>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        queue: Arc<dyn JobQueue>,
        processor: Arc<DeliveryProcessor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            processor,
            poll_interval,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// 停止が要求されるまでジョブを処理し続ける
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("ワーカーを開始しました");

        while !shutdown.is_cancelled() {
            match self.work_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        error.category = error::category::INFRASTRUCTURE,
                        error.kind = error::kind::DATABASE,
                        span_trace = %e.span_trace(),
                        "ジョブキューの操作に失敗しました: {}",
                        e
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("ワーカーを停止しました");
    }

    /// ジョブを 1 件予約して処理する
    ///
    /// 処理したら `true`、予約可能なジョブがなければ `false`。
    pub async fn work_once(&self) -> Result<bool, InfraError> {
        let Some(job) = self.queue.reserve(self.id).await? else {
            return Ok(false);
        };

        match self.processor.process(&job, self.id).await {
            Ok(()) => {}
            Err(e) if e.is_lease_lost() => warn_lease_lost(&job),
            Err(e) => self.record_failure(&job, &e).await?,
        }

        Ok(true)
    }

    async fn record_failure(&self, job: &Job, err: &DeliveryError) -> Result<(), InfraError> {
        let retryable = err.is_retryable();
        let status = match self
            .queue
            .fail(&job.id, self.id, &err.to_string(), retryable)
            .await
        {
            Ok(status) => status,
            Err(e) if e.is_lease_lost() => {
                warn_lease_lost(job);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        log_business_event!(
            event.category = event::category::DELIVERY,
            event.action = event::action::NOTIFICATION_FAILED,
            event.entity_type = event::entity_type::JOB,
            event.entity_id = %job.id,
            event.result = event::result::FAILURE,
            error.kind = err.kind(),
            retryable,
            "通知の送信に失敗しました: {}",
            err
        );

        match status {
            JobStatus::Failed => {
                log_business_event!(
                    event.category = event::category::JOB,
                    event.action = event::action::DEAD_LETTERED,
                    event.entity_type = event::entity_type::JOB,
                    event.entity_id = %job.id,
                    event.result = event::result::FAILURE,
                    attempts = job.attempts + 1,
                    "ジョブを終端失敗にしました"
                );
            }
            _ => {
                log_business_event!(
                    event.category = event::category::JOB,
                    event.action = event::action::RETRY_SCHEDULED,
                    event.entity_type = event::entity_type::JOB,
                    event.entity_id = %job.id,
                    event.result = event::result::SUCCESS,
                    attempts = job.attempts + 1,
                    "ジョブの再試行を予定しました"
                );
            }
        }

        Ok(())
    }
}

fn warn_lease_lost(job: &Job) {
    tracing::warn!(
        job_id = %job.id,
        "リースが切れて他のワーカーが回収したため、結果を記録せずに手放します"
    );
}

/// ワーカープール
pub struct WorkerPool {
    generator:     WorkerGenerator,
    queue:         Arc<dyn JobQueue>,
    processor:     Arc<DeliveryProcessor>,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        generator: WorkerGenerator,
        queue: Arc<dyn JobQueue>,
        processor: Arc<DeliveryProcessor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            generator,
            queue,
            processor,
            poll_interval,
        }
    }

    /// ワーカーを組み立てる
    pub fn workers(&self) -> Vec<Worker> {
        self.generator
            .ids()
            .into_iter()
            .map(|id| {
                Worker::new(
                    id,
                    self.queue.clone(),
                    self.processor.clone(),
                    self.poll_interval,
                )
            })
            .collect()
    }

    /// 全ワーカーを tokio タスクとして起動する
    ///
    /// 返したハンドルは停止要求後に join して、実行中のジョブの完了を待つ。
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.workers();
        tracing::info!(
            count = workers.len(),
            instance_index = self.generator.instance_index,
            "ワーカープールを起動します"
        );

        workers
            .into_iter()
            .map(|worker| {
                let span = tracing::info_span!("worker", worker_id = %worker.id());
                tokio::spawn(worker.run(shutdown.clone()).instrument(span))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use notifications_domain::{
        clock::{FixedClock, SystemClock},
        delivery::{Delivery, NotificationId, Options},
        job::RetryPolicy,
        message::Message,
    };
    use notifications_infra::{
        cloak::AesGcmCloak,
        db::TxContext,
        mail::{MailTransport, TransportError},
        mock::{
            MockJobQueue,
            MockMailTransport,
            MockReceiptRepository,
            MockTemplateLoader,
            MockTokenProvider,
            MockTransactionManager,
            MockUserDirectory,
        },
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::usecase::packager::{Packager, PackagerSettings};

    fn make_processor(
        queue: &MockJobQueue,
        transport: &MockMailTransport,
        directory: &MockUserDirectory,
    ) -> Arc<DeliveryProcessor> {
        make_processor_with(queue, Arc::new(transport.clone()), directory)
    }

    fn make_processor_with(
        queue: &MockJobQueue,
        transport: Arc<dyn MailTransport>,
        directory: &MockUserDirectory,
    ) -> Arc<DeliveryProcessor> {
        let packager = Packager::new(
            Arc::new(MockTemplateLoader::new()),
            Arc::new(AesGcmCloak::new("worker-test")),
            Arc::new(SystemClock),
            PackagerSettings {
                sender:         "no-reply@example.com".to_string(),
                domain:         "example.com".to_string(),
                subject_prefix: "CF Notification: ".to_string(),
            },
        );
        Arc::new(DeliveryProcessor::new(
            Arc::new(queue.clone()),
            Arc::new(MockReceiptRepository::new()),
            Arc::new(MockTransactionManager),
            Arc::new(MockTokenProvider::new()),
            Arc::new(directory.clone()),
            transport,
            packager,
        ))
    }

    /// 送信中にリースを切らせ、別のワーカーにジョブを回収させる送信実装
    struct StealingTransport {
        queue:   MockJobQueue,
        clock:   Arc<FixedClock>,
        succeed: bool,
    }

    #[async_trait]
    impl MailTransport for StealingTransport {
        async fn send(&self, _message: &Message) -> Result<(), TransportError> {
            self.clock.advance(chrono::Duration::seconds(61));
            self.queue.reserve(WorkerId::new(99)).await.unwrap().unwrap();
            if self.succeed {
                Ok(())
            } else {
                Err(TransportError::SendFailed("smtp down".to_string()))
            }
        }
    }

    async fn enqueue(queue: &MockJobQueue, user_guid: &str) {
        let delivery = Delivery {
            notification_id:  NotificationId::new(),
            user_guid:        user_guid.to_string(),
            options:          Options {
                kind_id: "acceptance-test".to_string(),
                text: "hello".to_string(),
                ..Default::default()
            },
            client_id:        "mister-client".to_string(),
            scope:            "user".to_string(),
            request_id:       String::new(),
            request_received: Utc::now(),
            space:            None,
            organization:     None,
        };
        let mut tx = TxContext::mock();
        queue
            .enqueue(&mut tx, &serde_json::to_value(&delivery).unwrap())
            .await
            .unwrap();
    }

    #[test]
    fn test_プールはインスタンス番号から算出したidのワーカーを作る() {
        let queue = MockJobQueue::default();
        let processor = make_processor(
            &queue,
            &MockMailTransport::new(),
            &MockUserDirectory::new(),
        );
        let pool = WorkerPool::new(
            WorkerGenerator::new(5, 2),
            Arc::new(queue),
            processor,
            Duration::from_millis(10),
        );

        let ids: Vec<i64> = pool.workers().iter().map(|w| w.id().as_i64()).collect();

        assert_eq!(ids, vec![11, 12, 13, 14, 15]);
    }

    #[tokio::test]
    async fn test_キューが空ならfalseを返す() {
        let queue = MockJobQueue::default();
        let processor = make_processor(
            &queue,
            &MockMailTransport::new(),
            &MockUserDirectory::new(),
        );
        let worker = Worker::new(
            WorkerId::new(1),
            Arc::new(queue),
            processor,
            Duration::from_millis(10),
        );

        assert!(!worker.work_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_1人の送信失敗は他の宛先の配信を妨げない() {
        let queue = MockJobQueue::default();
        let transport = MockMailTransport::new();
        let directory = MockUserDirectory::new();
        directory.add_user("user-1", Some("broken@example.com"));
        directory.add_user("user-2", Some("ok@example.com"));
        transport.fail_for("broken@example.com");
        enqueue(&queue, "user-1").await;
        enqueue(&queue, "user-2").await;
        let worker = Worker::new(
            WorkerId::new(1),
            Arc::new(queue.clone()),
            make_processor(&queue, &transport, &directory),
            Duration::from_millis(10),
        );

        assert!(worker.work_once().await.unwrap());
        assert!(worker.work_once().await.unwrap());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ok@example.com");

        let remaining = queue.jobs();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, JobStatus::Retrying);
        assert_eq!(remaining[0].attempts, 1);
        assert!(remaining[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_上限まで失敗したジョブは終端失敗になり再予約されない() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let queue = MockJobQueue::new(
            RetryPolicy {
                max_attempts: 3,
                lease:        Duration::from_secs(60),
            },
            clock.clone(),
        );
        let transport = MockMailTransport::new();
        let directory = MockUserDirectory::new();
        directory.add_user("user-1", Some("broken@example.com"));
        transport.fail_for("broken@example.com");
        enqueue(&queue, "user-1").await;
        let worker = Worker::new(
            WorkerId::new(1),
            Arc::new(queue.clone()),
            make_processor(&queue, &transport, &directory),
            Duration::from_millis(10),
        );

        for _ in 0..3 {
            assert!(worker.work_once().await.unwrap());
            clock.advance(chrono::Duration::hours(2));
        }

        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].attempts, 3);
        assert!(!worker.work_once().await.unwrap());
    }

    #[rstest]
    #[case::send_succeeds(true)]
    #[case::send_fails(false)]
    #[tokio::test]
    async fn test_処理中にリースを失ったジョブは回収したワーカーのまま残る(#[case] succeed: bool) {
        // Given
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        ));
        let queue = MockJobQueue::new(
            RetryPolicy {
                max_attempts: 5,
                lease:        Duration::from_secs(60),
            },
            clock.clone(),
        );
        let directory = MockUserDirectory::new();
        directory.add_user("user-1", Some("user-1@example.com"));
        enqueue(&queue, "user-1").await;
        let transport = Arc::new(StealingTransport {
            queue: queue.clone(),
            clock,
            succeed,
        });
        let worker = Worker::new(
            WorkerId::new(1),
            Arc::new(queue.clone()),
            make_processor_with(&queue, transport, &directory),
            Duration::from_millis(10),
        );

        // When
        let processed = worker.work_once().await.unwrap();

        // Then
        assert!(processed);
        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::InFlight);
        assert_eq!(jobs[0].worker_id, Some(99));
        assert_eq!(jobs[0].attempts, 1);
        assert!(jobs[0].last_error.is_none());
    }

    #[tokio::test]
    async fn test_メールアドレスのないユーザーは即座に終端失敗になる() {
        let queue = MockJobQueue::default();
        let directory = MockUserDirectory::new();
        directory.add_user("user-1", None);
        enqueue(&queue, "user-1").await;
        let worker = Worker::new(
            WorkerId::new(1),
            Arc::new(queue.clone()),
            make_processor(&queue, &MockMailTransport::new(), &directory),
            Duration::from_millis(10),
        );

        assert!(worker.work_once().await.unwrap());

        let jobs = queue.jobs();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_起動したプールはジョブを処理し停止要求で終了する() {
        let queue = MockJobQueue::default();
        let transport = MockMailTransport::new();
        let directory = MockUserDirectory::new();
        for user in ["user-1", "user-2", "user-3"] {
            directory.add_user(user, Some(&format!("{user}@example.com")));
            enqueue(&queue, user).await;
        }
        let pool = WorkerPool::new(
            WorkerGenerator::new(2, 0),
            Arc::new(queue.clone()),
            make_processor(&queue, &transport, &directory),
            Duration::from_millis(10),
        );
        let shutdown = CancellationToken::new();

        let handles = pool.spawn(shutdown.clone());

        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.sent().len() < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(transport.sent().len(), 3);
        assert!(queue.jobs().is_empty());
    }
}
