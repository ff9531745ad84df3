use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stored_files")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub download_id: String,
    pub session_token: String,
    pub storage_key: String,
    pub filename: String,
    pub size: i64,
    pub mime_type: String,
    pub digest: String,
    pub virus_scan: String,
    pub clamav_result: String,
    pub virustotal_result: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub warning: Option<String>,
    pub created_at: DateTimeUtc,
    pub expires_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
