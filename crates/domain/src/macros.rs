/// UUID をラップした ID 型を定義する
///
/// ジョブ ID と通知 ID は、どちらも投入時刻順に並ぶ UUID v7 で採番する。
/// 両者を取り違えないよう、それぞれ別の型にする。
///
/// # 使用例
///
/// ```rust
/// use notifications_domain::job::JobId;
///
/// let id = JobId::new();
/// let restored = JobId::from_uuid(*id.as_uuid());
/// assert_eq!(id, restored);
/// ```
macro_rules! define_uuid_id {
    (
        $(#[$meta:meta])*
        $vis:vis struct $Name:ident;
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash,
            serde::Serialize, serde::Deserialize,
            derive_more::Display,
        )]
        #[display("{_0}")]
        $vis struct $Name(uuid::Uuid);

        impl $Name {
            /// UUID v7 で採番する
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $Name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}
