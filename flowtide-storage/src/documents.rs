//! Typed access on top of the JSON document interface.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::collection::Collection;
use crate::error::StorageError;
use crate::filter::Filter;
use crate::{Storage, UpsertOutcome};

pub async fn put<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    collection: Collection,
    document: &T,
) -> Result<UpsertOutcome, StorageError> {
    let value = serde_json::to_value(document)?;
    storage.upsert(collection, value).await
}

pub async fn get<T: DeserializeOwned>(
    storage: &dyn Storage,
    collection: Collection,
    id: &str,
) -> Result<Option<T>, StorageError> {
    match storage.find_one(collection, &Filter::by_id(id)).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub async fn list<T: DeserializeOwned>(
    storage: &dyn Storage,
    collection: Collection,
    filter: &Filter,
) -> Result<Vec<T>, StorageError> {
    storage
        .find(collection, filter)
        .await?
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(StorageError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Service {
        #[serde(rename = "_id")]
        id: String,
        port: u16,
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let storage = MemoryStorage::new();
        let svc = Service {
            id: "22".into(),
            port: 22,
        };
        put(&storage, Collection::Services, &svc).await.unwrap();
        let back: Option<Service> = get(&storage, Collection::Services, "22").await.unwrap();
        assert_eq!(back, Some(svc));
        let all: Vec<Service> = list(&storage, Collection::Services, &Filter::all())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }
}
