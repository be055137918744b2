use serde::{Deserialize, Serialize};

pub type AccountId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: i64,
}

impl Account {
    pub fn new(id: AccountId, balance: i64) -> Self {
        Self { id, balance }
    }
}
