//! # 配信手続き
//!
//! ワーカーが予約したジョブ 1 件を処理する。
//!
//! 1. ペイロードを [`Delivery`] にデコードする
//! 2. 宛先アドレスを決める（明示されていなければユーザーディレクトリで引く）
//! 3. パッケージャでメッセージを組み立てる
//! 4. メール送信に渡す
//! 5. 成功したら、配信記録の upsert とジョブの削除を 1 つのトランザクションで行う
//!
//! 失敗はジョブ単位で、呼び出し側（ワーカー）が [`DeliveryError::is_retryable`] を見て
//! キューに再試行か終端失敗かを記録する。
//!
//! 送信成功後にトランザクションが失敗した場合はジョブが再試行され、同じメールが
//! もう一度送られうる（少なくとも 1 回の配信）。

use std::sync::Arc;

use notifications_domain::{delivery::Delivery, job::Job, receipt::ReceiptKey, worker::WorkerId};
use notifications_infra::{
    InfraError,
    client::{DirectoryError, TokenError, TokenProvider, UserDirectory},
    db::TransactionManager,
    mail::{MailTransport, TransportError},
    repository::{JobQueue, ReceiptRepository},
};
use notifications_shared::{
    event_log::{error, event},
    log_business_event,
};
use thiserror::Error;

use super::{
    packager::{Packager, PackagerError},
    template_renderer::TemplateError,
};

/// 配信エラー
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// ペイロードを配信内容として解釈できない
    #[error("ペイロードを解釈できません: {0}")]
    Payload(String),

    #[error("アクセストークンを取得できません: {0}")]
    Token(#[from] TokenError),

    #[error("ユーザーを照会できません: {0}")]
    Directory(#[from] DirectoryError),

    /// ユーザーにメールアドレスが登録されていない
    #[error("メールアドレスが登録されていません: {0}")]
    MissingEmail(String),

    #[error(transparent)]
    Packager(#[from] PackagerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 配信記録の更新・ジョブの削除に失敗
    #[error("配信結果を記録できません: {0}")]
    Database(#[from] InfraError),
}

impl DeliveryError {
    /// 再試行で解消しうるか
    ///
    /// 入力やデータの不備による失敗は何度試しても同じ結果になるため、即座に終端失敗にする。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Payload(_) | Self::MissingEmail(_) => false,
            Self::Token(e) => matches!(e, TokenError::Unavailable(_)),
            Self::Directory(e) => matches!(e, DirectoryError::Unavailable(_)),
            Self::Packager(e) => e.is_retryable(),
            Self::Transport(_) | Self::Database(_) => true,
        }
    }

    /// 完了の記録時に、リース切れで他のワーカーへジョブが移っていた
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::Database(e) if e.is_lease_lost())
    }

    /// ログの `error.kind`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Payload(_) => error::kind::PAYLOAD,
            Self::Token(_) => error::kind::TOKEN,
            Self::Directory(_) | Self::MissingEmail(_) => error::kind::MEMBERSHIP,
            Self::Packager(PackagerError::TemplateStore(_)) | Self::Database(_) => {
                error::kind::DATABASE
            }
            Self::Packager(PackagerError::Template(_)) => error::kind::TEMPLATE,
            Self::Packager(PackagerError::Cloak(_)) => error::kind::INTERNAL,
            Self::Transport(_) => error::kind::MAIL_TRANSPORT,
        }
    }
}

impl From<TemplateError> for DeliveryError {
    fn from(err: TemplateError) -> Self {
        Self::Packager(PackagerError::Template(err))
    }
}

/// 配信手続きの実行者
pub struct DeliveryProcessor {
    queue:      Arc<dyn JobQueue>,
    receipts:   Arc<dyn ReceiptRepository>,
    tx_manager: Arc<dyn TransactionManager>,
    tokens:     Arc<dyn TokenProvider>,
    directory:  Arc<dyn UserDirectory>,
    transport:  Arc<dyn MailTransport>,
    packager:   Packager,
}

impl DeliveryProcessor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        receipts: Arc<dyn ReceiptRepository>,
        tx_manager: Arc<dyn TransactionManager>,
        tokens: Arc<dyn TokenProvider>,
        directory: Arc<dyn UserDirectory>,
        transport: Arc<dyn MailTransport>,
        packager: Packager,
    ) -> Self {
        Self {
            queue,
            receipts,
            tx_manager,
            tokens,
            directory,
            transport,
            packager,
        }
    }

    /// ジョブ 1 件を配信する
    ///
    /// 成功時はジョブが削除済み。失敗時のキューへの記録は呼び出し側が行う。
    /// `worker_id` がリースを失っていれば配信記録はロールバックされる。
    #[tracing::instrument(skip_all, fields(job_id = %job.id, attempts = job.attempts))]
    pub async fn process(&self, job: &Job, worker_id: WorkerId) -> Result<(), DeliveryError> {
        let delivery: Delivery = job
            .decode()
            .map_err(|e| DeliveryError::Payload(e.to_string()))?;

        let to = self.resolve_address(&delivery).await?;

        let context = self.packager.prepare_context(&delivery, &to).await?;
        let message = self.packager.pack(&context)?;

        self.transport.send(&message).await?;

        let key = ReceiptKey::new(
            &delivery.user_guid,
            &delivery.client_id,
            &delivery.options.kind_id,
        );
        let mut tx = self.tx_manager.begin().await?;
        let receipt = self.receipts.upsert(&mut tx, &key).await?;
        self.queue.succeed(&mut tx, &job.id, worker_id).await?;
        tx.commit().await?;

        log_business_event!(
            event.category = event::category::DELIVERY,
            event.action = event::action::NOTIFICATION_SENT,
            event.entity_type = event::entity_type::RECEIPT,
            event.entity_id = receipt.id,
            event.result = event::result::SUCCESS,
            event.client_id = %delivery.client_id,
            notification_id = %delivery.notification_id,
            user_guid = %delivery.user_guid,
            kind_id = %delivery.options.kind_id,
            receipt_count = receipt.count,
            "通知を送信しました"
        );

        Ok(())
    }

    /// 宛先アドレスを決める
    async fn resolve_address(&self, delivery: &Delivery) -> Result<String, DeliveryError> {
        if !delivery.options.to.trim().is_empty() {
            return Ok(delivery.options.to.clone());
        }

        let token = self.tokens.get_token().await?;
        self.directory
            .find_email(&delivery.user_guid, &token)
            .await?
            .ok_or_else(|| DeliveryError::MissingEmail(delivery.user_guid.clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use notifications_domain::{
        clock::FixedClock,
        delivery::{NotificationId, Options},
        job::JobStatus,
    };
    use notifications_infra::{
        cloak::AesGcmCloak,
        db::TxContext,
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
    use crate::usecase::packager::PackagerSettings;

    struct Fixture {
        queue:     MockJobQueue,
        receipts:  MockReceiptRepository,
        transport: MockMailTransport,
        directory: MockUserDirectory,
        sut:       DeliveryProcessor,
    }

    fn setup() -> Fixture {
        let queue = MockJobQueue::default();
        let receipts = MockReceiptRepository::new();
        let transport = MockMailTransport::new();
        let directory = MockUserDirectory::new();
        directory.add_user("user-1", Some("user-1@example.com"));

        let packager = Packager::new(
            Arc::new(MockTemplateLoader::new()),
            Arc::new(AesGcmCloak::new("delivery-test")),
            Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
            )),
            PackagerSettings {
                sender:         "no-reply@example.com".to_string(),
                domain:         "example.com".to_string(),
                subject_prefix: "CF Notification: ".to_string(),
            },
        );
        let sut = DeliveryProcessor::new(
            Arc::new(queue.clone()),
            Arc::new(receipts.clone()),
            Arc::new(MockTransactionManager),
            Arc::new(MockTokenProvider::new()),
            Arc::new(directory.clone()),
            Arc::new(transport.clone()),
            packager,
        );

        Fixture {
            queue,
            receipts,
            transport,
            directory,
            sut,
        }
    }

    fn make_delivery(user_guid: &str) -> Delivery {
        Delivery {
            notification_id:  NotificationId::new(),
            user_guid:        user_guid.to_string(),
            options:          Options {
                subject: "my-spammy-subject".to_string(),
                kind_id: "acceptance-test".to_string(),
                text: "hello".to_string(),
                endorsement: "This message was sent directly to you.".to_string(),
                ..Default::default()
            },
            client_id:        "mister-client".to_string(),
            scope:            "user".to_string(),
            request_id:       String::new(),
            request_received: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
            space:            None,
            organization:     None,
        }
    }

    fn worker() -> WorkerId {
        WorkerId::new(1)
    }

    async fn enqueue_and_reserve(queue: &MockJobQueue, delivery: &Delivery) -> Job {
        let payload = serde_json::to_value(delivery).unwrap();
        let mut tx = TxContext::mock();
        queue.enqueue(&mut tx, &payload).await.unwrap();
        queue
            .reserve(worker())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_送信に成功すると配信記録を作りジョブを削除する() {
        let fx = setup();
        let job = enqueue_and_reserve(&fx.queue, &make_delivery("user-1")).await;

        fx.sut.process(&job, worker()).await.unwrap();

        let sent = fx.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "user-1@example.com");
        assert_eq!(sent[0].subject, "CF Notification: my-spammy-subject");

        let receipts = fx.receipts.receipts();
        assert_eq!(receipts.len(), 1);
        assert_eq!(
            receipts[0].key(),
            ReceiptKey::new("user-1", "mister-client", "acceptance-test")
        );
        assert_eq!(receipts[0].count, 1);
        assert!(fx.queue.find(&job.id).is_none());
    }

    #[tokio::test]
    async fn test_宛先が明示されていればディレクトリを引かない() {
        let fx = setup();
        let mut delivery = make_delivery("unknown-user");
        delivery.options.to = "direct@example.com".to_string();
        let job = enqueue_and_reserve(&fx.queue, &delivery).await;

        fx.sut.process(&job, worker()).await.unwrap();

        assert_eq!(fx.transport.sent()[0].to, "direct@example.com");
    }

    #[tokio::test]
    async fn test_同じ宛先への2回目の配信は配信記録のcountを増やす() {
        let fx = setup();
        for _ in 0..2 {
            let job = enqueue_and_reserve(&fx.queue, &make_delivery("user-1")).await;
            fx.sut.process(&job, worker()).await.unwrap();
        }

        let receipts = fx.receipts.receipts();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].count, 2);
    }

    #[tokio::test]
    async fn test_送信失敗は再試行可能なエラーになり配信記録を作らない() {
        let fx = setup();
        fx.transport.fail_for("user-1@example.com");
        let job = enqueue_and_reserve(&fx.queue, &make_delivery("user-1")).await;

        let err = fx.sut.process(&job, worker()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Transport(_)));
        assert!(err.is_retryable());
        assert!(fx.receipts.receipts().is_empty());
        assert_eq!(
            fx.queue.find(&job.id).map(|j| j.status),
            Some(JobStatus::InFlight)
        );
    }

    #[tokio::test]
    async fn test_メールアドレスのないユーザーは再試行しない() {
        let fx = setup();
        fx.directory.add_user("user-2", None);
        let job = enqueue_and_reserve(&fx.queue, &make_delivery("user-2")).await;

        let err = fx.sut.process(&job, worker()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::MissingEmail(ref guid) if guid == "user-2"));
        assert!(!err.is_retryable());
        assert!(fx.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_デコードできないペイロードは再試行しない() {
        let fx = setup();
        let mut tx = TxContext::mock();
        fx.queue
            .enqueue(&mut tx, &serde_json::json!({"unexpected": true}))
            .await
            .unwrap();
        let job = fx
            .queue
            .reserve(worker())
            .await
            .unwrap()
            .unwrap();

        let err = fx.sut.process(&job, worker()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Payload(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_リースを失ったワーカーの完了は記録されない() {
        let fx = setup();
        let job = enqueue_and_reserve(&fx.queue, &make_delivery("user-1")).await;

        let err = fx.sut.process(&job, WorkerId::new(2)).await.unwrap_err();

        assert!(err.is_lease_lost());
        assert_eq!(
            fx.queue.find(&job.id).map(|j| (j.status, j.worker_id)),
            Some((JobStatus::InFlight, Some(1)))
        );
    }

    #[rstest]
    #[case(DeliveryError::Token(TokenError::Unavailable("down".into())), true)]
    #[case(DeliveryError::Token(TokenError::Rejected("bad".into())), false)]
    #[case(DeliveryError::Directory(DirectoryError::Unavailable("down".into())), true)]
    #[case(DeliveryError::Directory(DirectoryError::NotFound("user".into())), false)]
    #[case(DeliveryError::from(TemplateError::Empty), false)]
    #[case(DeliveryError::Packager(PackagerError::TemplateStore(InfraError::unexpected("db"))), true)]
    #[case(DeliveryError::Transport(TransportError::SendFailed("smtp".into())), true)]
    fn test_再試行可否の分類(#[case] error: DeliveryError, #[case] expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }
}
