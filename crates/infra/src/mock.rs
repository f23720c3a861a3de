//! # テスト用モック
//!
//! ユースケーステストと結合シナリオで使用するインメモリ実装。
//! `test-utils` feature を有効にすることで、他クレートからも利用可能。
//!
//! ```toml
//! [dev-dependencies]
//! notifications-infra = { workspace = true, features = ["test-utils"] }
//! ```
//!
//! モックは [`TxContext`] を無視するため、ロールバックしても書き込みは残る。
//! ロールバックの検証は PostgreSQL 統合テストで行う。

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use notifications_domain::{
    audience::{Organization, Space},
    clock::{Clock, SystemClock},
    job::{Job, JobId, JobStatus, RetryPolicy},
    message::Message,
    receipt::{Receipt, ReceiptKey},
    template::{DEFAULT_TEMPLATE_ID, Templates},
    worker::WorkerId,
};

use crate::{
    client::{
        DirectoryError,
        MembershipError,
        MembershipProvider,
        TokenError,
        TokenProvider,
        UserDirectory,
    },
    db::{TransactionManager, TxContext},
    error::InfraError,
    mail::{MailTransport, TransportError},
    repository::{
        JobQueue,
        ReceiptRepository,
        TemplateLoader,
        default_templates,
        job_queue::LEASE_EXHAUSTED_ERROR,
    },
};

// ===== MockTransactionManager =====

#[derive(Clone, Default)]
pub struct MockTransactionManager;

#[async_trait]
impl TransactionManager for MockTransactionManager {
    async fn begin(&self) -> Result<TxContext, InfraError> {
        Ok(TxContext::mock())
    }
}

// ===== MockJobQueue =====

/// インメモリのジョブキュー
///
/// 予約は 1 つのロックの中で選択と状態遷移を行うため、
/// 同時に予約しても同じジョブが 2 回返ることはない。
/// リース切れの回収と、リース保持者だけが完了・失敗を記録できる点は PostgreSQL 実装と同じ。
#[derive(Clone)]
pub struct MockJobQueue {
    jobs:   Arc<Mutex<Vec<Job>>>,
    policy: RetryPolicy,
    clock:  Arc<dyn Clock>,
}

impl Default for MockJobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), Arc::new(SystemClock))
    }
}

impl MockJobQueue {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Vec::new())),
            policy,
            clock,
        }
    }

    /// 現在キューにあるジョブ（完了したものは含まない）
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn find(&self, job_id: &JobId) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| &j.id == job_id)
            .cloned()
    }
}

#[async_trait]
impl JobQueue for MockJobQueue {
    async fn enqueue(
        &self,
        _tx: &mut TxContext,
        payload: &serde_json::Value,
    ) -> Result<Job, InfraError> {
        let job = Job::new_pending(payload.clone(), self.clock.now());
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn reserve(&self, worker_id: WorkerId) -> Result<Option<Job>, InfraError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap();

        loop {
            let Some(job) = jobs
                .iter_mut()
                .filter(|j| j.is_reservable(now))
                .min_by_key(|j| j.scheduled_at)
            else {
                return Ok(None);
            };

            if job.status == JobStatus::InFlight {
                let decision = self.policy.reclaim(job.attempts, now);
                job.attempts = decision.attempts;
                if decision.status == JobStatus::Failed {
                    job.status = JobStatus::Failed;
                    job.worker_id = None;
                    job.lease_expires_at = None;
                    job.last_error = Some(LEASE_EXHAUSTED_ERROR.to_string());
                    job.updated_at = now;
                    continue;
                }
            }

            job.status = JobStatus::InFlight;
            job.worker_id = Some(worker_id.as_i64());
            job.lease_expires_at = Some(self.policy.lease_expires_at(now));
            job.updated_at = now;
            return Ok(Some(job.clone()));
        }
    }

    async fn succeed(
        &self,
        _tx: &mut TxContext,
        job_id: &JobId,
        worker_id: WorkerId,
    ) -> Result<(), InfraError> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| !(&j.id == job_id && j.is_held_by(worker_id.as_i64())));

        if jobs.len() == before {
            return Err(InfraError::lease_lost(job_id.to_string(), worker_id.as_i64()));
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &JobId,
        worker_id: WorkerId,
        error: &str,
        retryable: bool,
    ) -> Result<JobStatus, InfraError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| &j.id == job_id && j.is_held_by(worker_id.as_i64()))
            .ok_or_else(|| InfraError::lease_lost(job_id.to_string(), worker_id.as_i64()))?;

        let decision = self.policy.decide(job.attempts, retryable, now);
        job.status = decision.status;
        job.attempts = decision.attempts;
        job.scheduled_at = decision.scheduled_at;
        job.worker_id = None;
        job.lease_expires_at = None;
        job.last_error = Some(error.to_string());
        job.updated_at = now;

        Ok(decision.status)
    }

    async fn find_failed(&self, limit: i64) -> Result<Vec<Job>, InfraError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn retry_failed(&self, _tx: &mut TxContext, job_id: &JobId) -> Result<(), InfraError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| &j.id == job_id && j.status == JobStatus::Failed)
            .ok_or_else(|| InfraError::not_found("Job", job_id.to_string()))?;

        job.status = JobStatus::Pending;
        job.manual_retries += 1;
        job.scheduled_at = now;
        job.last_error = None;
        job.updated_at = now;
        Ok(())
    }
}

// ===== MockReceiptRepository =====

#[derive(Clone, Default)]
pub struct MockReceiptRepository {
    receipts: Arc<Mutex<Vec<Receipt>>>,
}

impl MockReceiptRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receipts(&self) -> Vec<Receipt> {
        self.receipts.lock().unwrap().clone()
    }

    fn increment(receipts: &mut Vec<Receipt>, key: &ReceiptKey) -> Receipt {
        if let Some(existing) = receipts.iter_mut().find(|r| &r.key() == key) {
            existing.count += 1;
            return existing.clone();
        }
        let receipt = Receipt {
            id:         receipts.len() as i64 + 1,
            user_guid:  key.user_guid.clone(),
            client_id:  key.client_id.clone(),
            kind_id:    key.kind_id.clone(),
            count:      1,
            created_at: Utc::now(),
        };
        receipts.push(receipt.clone());
        receipt
    }
}

#[async_trait]
impl ReceiptRepository for MockReceiptRepository {
    async fn create(&self, _tx: &mut TxContext, key: &ReceiptKey) -> Result<Receipt, InfraError> {
        let mut receipts = self.receipts.lock().unwrap();
        if receipts.iter().any(|r| &r.key() == key) {
            return Err(InfraError::duplicate("Receipt", key.to_string()));
        }
        Ok(Self::increment(&mut receipts, key))
    }

    async fn upsert(&self, _tx: &mut TxContext, key: &ReceiptKey) -> Result<Receipt, InfraError> {
        let mut receipts = self.receipts.lock().unwrap();
        Ok(Self::increment(&mut receipts, key))
    }

    async fn create_receipts(
        &self,
        _tx: &mut TxContext,
        user_guids: &[String],
        client_id: &str,
        kind_id: &str,
    ) -> Result<(), InfraError> {
        let mut receipts = self.receipts.lock().unwrap();
        let unique: HashSet<&String> = user_guids.iter().collect();
        for user_guid in unique {
            Self::increment(&mut receipts, &ReceiptKey::new(user_guid, client_id, kind_id));
        }
        Ok(())
    }

    async fn find(&self, key: &ReceiptKey) -> Result<Receipt, InfraError> {
        self.receipts
            .lock()
            .unwrap()
            .iter()
            .find(|r| &r.key() == key)
            .cloned()
            .ok_or_else(|| InfraError::not_found("Receipt", key.to_string()))
    }
}

// ===== MockTemplateLoader =====

/// インメモリのテンプレートローダー
///
/// 明示指定、クライアント割り当て、既定の順に選ぶ。
#[derive(Clone, Default)]
pub struct MockTemplateLoader {
    by_id:     Arc<Mutex<HashMap<String, Templates>>>,
    by_client: Arc<Mutex<HashMap<String, Templates>>>,
}

impl MockTemplateLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_template(&self, template_id: &str, templates: Templates) {
        self.by_id
            .lock()
            .unwrap()
            .insert(template_id.to_string(), templates);
    }

    pub fn assign_client(&self, client_id: &str, templates: Templates) {
        self.by_client
            .lock()
            .unwrap()
            .insert(client_id.to_string(), templates);
    }
}

#[async_trait]
impl TemplateLoader for MockTemplateLoader {
    async fn load_templates(
        &self,
        client_id: &str,
        _kind_id: &str,
        template_id: Option<&str>,
    ) -> Result<Templates, InfraError> {
        if let Some(template_id) = template_id {
            if template_id == DEFAULT_TEMPLATE_ID {
                return Ok(default_templates());
            }
            return self
                .by_id
                .lock()
                .unwrap()
                .get(template_id)
                .cloned()
                .ok_or_else(|| InfraError::not_found("Template", template_id));
        }

        Ok(self
            .by_client
            .lock()
            .unwrap()
            .get(client_id)
            .cloned()
            .unwrap_or_else(default_templates))
    }
}

// ===== MockMailTransport =====

/// 送信したメッセージを記録するメール送信
#[derive(Clone, Default)]
pub struct MockMailTransport {
    sent:       Arc<Mutex<Vec<Message>>>,
    failing_to: Arc<Mutex<HashSet<String>>>,
}

impl MockMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 送信に成功したメッセージ
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// 指定した宛先への送信を常に失敗させる
    pub fn fail_for(&self, to: &str) {
        self.failing_to.lock().unwrap().insert(to.to_string());
    }
}

#[async_trait]
impl MailTransport for MockMailTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.failing_to.lock().unwrap().contains(&message.to) {
            return Err(TransportError::SendFailed(format!(
                "{} への送信に失敗",
                message.to
            )));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// ===== MockTokenProvider =====

#[derive(Clone, Default)]
pub struct MockTokenProvider {
    calls:       Arc<AtomicUsize>,
    unavailable: Arc<Mutex<bool>>,
}

impl MockTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self) {
        *self.unavailable.lock().unwrap() = true;
    }

    /// `get_token` が呼ばれた回数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn get_token(&self) -> Result<String, TokenError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.unavailable.lock().unwrap() {
            return Err(TokenError::Unavailable("mock".to_string()));
        }
        Ok("mock-token".to_string())
    }
}

// ===== MockMembershipProvider =====

#[derive(Clone, Default)]
pub struct MockMembershipProvider {
    spaces:        Arc<Mutex<HashMap<String, (Space, Vec<String>)>>>,
    organizations: Arc<Mutex<HashMap<String, (Organization, Vec<String>)>>>,
    all_users:     Arc<Mutex<Vec<String>>>,
    unavailable:   Arc<Mutex<bool>>,
}

impl MockMembershipProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_space(&self, space: Space, members: Vec<String>) {
        self.spaces
            .lock()
            .unwrap()
            .insert(space.guid.clone(), (space, members));
    }

    pub fn add_organization(&self, organization: Organization, members: Vec<String>) {
        self.organizations
            .lock()
            .unwrap()
            .insert(organization.guid.clone(), (organization, members));
    }

    pub fn set_all_users(&self, users: Vec<String>) {
        *self.all_users.lock().unwrap() = users;
    }

    pub fn set_unavailable(&self) {
        *self.unavailable.lock().unwrap() = true;
    }

    fn check_available(&self) -> Result<(), MembershipError> {
        if *self.unavailable.lock().unwrap() {
            return Err(MembershipError::Unavailable("mock".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipProvider for MockMembershipProvider {
    async fn load_space(&self, space_guid: &str, _token: &str) -> Result<Space, MembershipError> {
        self.check_available()?;
        self.spaces
            .lock()
            .unwrap()
            .get(space_guid)
            .map(|(space, _)| space.clone())
            .ok_or_else(|| MembershipError::NotFound(space_guid.to_string()))
    }

    async fn load_organization(
        &self,
        org_guid: &str,
        _token: &str,
    ) -> Result<Organization, MembershipError> {
        self.check_available()?;
        self.organizations
            .lock()
            .unwrap()
            .get(org_guid)
            .map(|(org, _)| org.clone())
            .ok_or_else(|| MembershipError::NotFound(org_guid.to_string()))
    }

    async fn resolve_space_members(
        &self,
        space_guid: &str,
        _token: &str,
    ) -> Result<Vec<String>, MembershipError> {
        self.check_available()?;
        self.spaces
            .lock()
            .unwrap()
            .get(space_guid)
            .map(|(_, members)| members.clone())
            .ok_or_else(|| MembershipError::NotFound(space_guid.to_string()))
    }

    async fn resolve_org_members(
        &self,
        org_guid: &str,
        _token: &str,
    ) -> Result<Vec<String>, MembershipError> {
        self.check_available()?;
        self.organizations
            .lock()
            .unwrap()
            .get(org_guid)
            .map(|(_, members)| members.clone())
            .ok_or_else(|| MembershipError::NotFound(org_guid.to_string()))
    }

    async fn resolve_all(&self, _token: &str) -> Result<Vec<String>, MembershipError> {
        self.check_available()?;
        Ok(self.all_users.lock().unwrap().clone())
    }
}

// ===== MockUserDirectory =====

/// ユーザー GUID からメールアドレスを引くディレクトリ
///
/// 登録されていない GUID は NotFound になる。
#[derive(Clone, Default)]
pub struct MockUserDirectory {
    emails: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl MockUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_guid: &str, email: Option<&str>) {
        self.emails
            .lock()
            .unwrap()
            .insert(user_guid.to_string(), email.map(str::to_string));
    }
}

#[async_trait]
impl UserDirectory for MockUserDirectory {
    async fn find_email(
        &self,
        user_guid: &str,
        _token: &str,
    ) -> Result<Option<String>, DirectoryError> {
        self.emails
            .lock()
            .unwrap()
            .get(user_guid)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(user_guid.to_string()))
    }
}
