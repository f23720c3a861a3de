//! # ユースケース層
//!
//! 配信受付からメール送信までの処理を組み立てる。
//!
//! ```text
//! 受付:   handler → Dispatcher → Strategy（宛先解決）→ Enqueuer → JobQueue
//! 配信:   WorkerPool → Worker → DeliveryProcessor → Packager → MailTransport
//!                                               └→ ReceiptRepository / JobQueue
//! ```
//!
//! HTTP リクエストの処理は送信 I/O を待たない。受付はジョブを投入した時点で
//! 応答を返し、送信はワーカーが非同期に行う。

pub mod delivery;
pub mod enqueuer;
pub mod packager;
pub mod strategy;
pub mod template_renderer;
pub mod worker;

pub use delivery::{DeliveryError, DeliveryProcessor};
pub use enqueuer::Enqueuer;
pub use packager::{MessageContext, Packager, PackagerError, PackagerSettings};
pub use strategy::{
    DispatchRequest,
    Dispatcher,
    EveryoneStrategy,
    OrganizationStrategy,
    RecipientsStrategy,
    Resolution,
    SpaceStrategy,
    Strategy,
    UserStrategy,
};
pub use template_renderer::{Surface, TemplateError, TemplateRenderer, TemplateVars};
pub use worker::{Worker, WorkerPool};
