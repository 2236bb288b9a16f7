use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{HolderInfo, ResourceInfo};

/// Read-only lookups into the room and user stores, used to enrich query
/// results. The engine never writes through it.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resource(&self, id: Ulid) -> Option<ResourceInfo>;
    async fn holder(&self, id: Ulid) -> Option<HolderInfo>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    resources: DashMap<Ulid, ResourceInfo>,
    holders: DashMap<Ulid, HolderInfo>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_resource(&self, info: ResourceInfo) {
        self.resources.insert(info.id, info);
    }

    pub fn register_holder(&self, info: HolderInfo) {
        self.holders.insert(info.id, info);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn resource(&self, id: Ulid) -> Option<ResourceInfo> {
        self.resources.get(&id).map(|e| e.value().clone())
    }

    async fn holder(&self, id: Ulid) -> Option<HolderInfo> {
        self.holders.get(&id).map(|e| e.value().clone())
    }
}
