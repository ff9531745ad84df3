use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Digests of files previously detected as malware
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "hash_blacklist")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub file_hash: String,
    pub detection_source: String,
    #[sea_orm(column_type = "Text")]
    pub detail: String,
    pub first_detected: DateTimeUtc,
    pub last_detected: DateTimeUtc,
    #[sea_orm(default_value = 1)]
    pub detection_count: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
