//! # Enqueuer
//!
//! 解決済みの宛先 1 件ごとに配信内容を組み立て、ジョブとして投入する。
//! 全戦略が共有する投入手続き。

use std::sync::Arc;

use notifications_domain::{
    audience::{DispatchResponse, DispatchStatus},
    delivery::{Delivery, NotificationId, Options},
};
use notifications_infra::{db::TxContext, repository::JobQueue};
use notifications_shared::{event_log::event, log_business_event};

use super::strategy::{DispatchRequest, Resolution};
use crate::error::ServiceError;

pub struct Enqueuer {
    queue: Arc<dyn JobQueue>,
}

impl Enqueuer {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// 宛先ごとにジョブを投入し、受付結果を返す
    ///
    /// 1 件でも投入に失敗したらエラーを返す。残りの宛先は投入しない。
    pub async fn enqueue(
        &self,
        tx: &mut TxContext,
        scope: &str,
        resolution: Resolution,
        request: &DispatchRequest,
    ) -> Result<Vec<DispatchResponse>, ServiceError> {
        let Resolution {
            recipients,
            endorsement,
            space,
            organization,
        } = resolution;

        let options = Options {
            endorsement: endorsement.to_string(),
            ..request.options.clone()
        };

        let mut responses = Vec::with_capacity(recipients.len());
        for user_guid in recipients {
            let delivery = Delivery {
                notification_id: NotificationId::new(),
                user_guid: user_guid.clone(),
                options: options.clone(),
                client_id: request.client_id.clone(),
                scope: scope.to_string(),
                request_id: request.request_id.clone(),
                request_received: request.request_received,
                space: space.clone(),
                organization: organization.clone(),
            };

            let payload = serde_json::to_value(&delivery)
                .map_err(|e| ServiceError::Internal(format!("ペイロードの変換に失敗: {e}")))?;
            let job = self.queue.enqueue(tx, &payload).await?;

            log_business_event!(
                event.category = event::category::DISPATCH,
                event.action = event::action::NOTIFICATION_QUEUED,
                event.entity_type = event::entity_type::JOB,
                event.entity_id = %job.id,
                event.result = event::result::SUCCESS,
                event.client_id = %delivery.client_id,
                notification_id = %delivery.notification_id,
                user_guid = %user_guid,
                "通知をキューに投入しました"
            );

            responses.push(DispatchResponse {
                recipient:       user_guid,
                notification_id: delivery.notification_id.to_string(),
                status:          DispatchStatus::Queued,
            });
        }

        Ok(responses)
    }
}
