// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The bucket/object lifecycle seam.

use async_trait::async_trait;

use crate::error::StorageError;

/// Bucket and object lifecycle operations the streaming core may invoke but
/// does not implement.
///
/// Production implementations live alongside credential and channel
/// management; tests back this with the in-memory store their fake transport
/// serves from.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Creates `bucket` if it does not exist.
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Deletes an object, or a specific generation of it.
    async fn delete_object(
        &self,
        bucket: &str,
        object: &str,
        generation: Option<i64>,
    ) -> Result<(), StorageError>;

    /// Whether the named object currently exists.
    async fn object_exists(&self, bucket: &str, object: &str) -> Result<bool, StorageError>;
}
