// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of popcon.
//
// popcon is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// popcon is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with popcon.  If not,
// see <http://www.gnu.org/licenses/>.

//! # dynamodb
//!
//! [Backend] implementation for DynamoDB.
//!
//! [Backend]: crate::storage::Backend
//!
//! Each popcon partition is a separate table, each with the same, trivial schema:
//!
//! | attribute  | type | notes                    |
//! |------------|------|--------------------------|
//! | `pk`       | S    | hash key                 |
//! | `value`    | S    |                          |
//! | `metadata` | M    | string-valued; optional  |
//!
//! DynamoDB will throttle writes that exceed a table's provisioned throughput; those rejections
//! surface as [QuotaExceeded](crate::storage::Error::QuotaExceeded) so that callers can tell them
//! apart from other failures.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, meta::region::RegionProviderChain};
use aws_sdk_dynamodb::{
    config::Credentials as AwsCredentials,
    error::SdkError,
    operation::put_item::{PutItemError, builders::PutItemFluentBuilder},
    types::AttributeValue,
};
use secrecy::SecretString;
use serde::Deserialize;
use snafu::{Backtrace, OptionExt, Snafu};
use tracing::debug;
use url::Url;

use crate::storage::{self, Backend, Item};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Attribute {name} of item {key} was of an unexpected type"))]
    BadAttrType {
        key: String,
        name: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Item {key} had no {name} attribute"))]
    MissingAttr {
        key: String,
        name: String,
        backtrace: Backtrace,
    },
    #[snafu(display("No endpoint URLs specified"))]
    NoEndpoints { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

/// Where to find DynamoDB
///
/// If you're truly talking to DynamoDB in AWS, give a region. If you're talking to something that
/// speaks the DynamoDB protocol locally (DynamoDB Local, or ScyllaDB over Alternator), give one or
/// more endpoint URLs.
#[derive(Clone, Debug, Deserialize)]
pub enum Location {
    #[serde(rename = "region")]
    Region(String),
    #[serde(rename = "endpoints")]
    Endpoints(Vec<Url>),
}

/// AWS credentials: key ID & secret key
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    #[serde(rename = "key-id")]
    pub key_id: SecretString,
    pub secret: SecretString,
}

/// Table names for each of the three popcon partitions
#[derive(Clone, Debug, Deserialize)]
pub struct Tables {
    pub cache: String,
    pub blobs: String,
    pub votes: String,
}

impl Default for Tables {
    fn default() -> Self {
        Tables {
            cache: "popcon-cache".to_owned(),
            blobs: "popcon-blobs".to_owned(),
            votes: "popcon-votes".to_owned(),
        }
    }
}

pub struct Client {
    client: ::aws_sdk_dynamodb::Client,
}

impl Client {
    pub async fn new(location: &Location, credentials: &Option<Credentials>) -> Result<Client> {
        use secrecy::ExposeSecret;
        let creds = credentials.as_ref().map(|c| {
            AwsCredentials::new(
                c.key_id.expose_secret(),
                c.secret.expose_secret(),
                None,
                None,
                "popcon",
            )
        });

        let config = match location {
            Location::Region(region) => {
                let region_provider =
                    RegionProviderChain::first_try(Some(Region::new(region.clone())))
                        .or_default_provider()
                        .or_else(Region::new("us-west-2"));
                let mut loader =
                    aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
            Location::Endpoints(endpoints) => {
                let ep_url = endpoints.first().context(NoEndpointsSnafu)?;
                let mut loader =
                    aws_config::defaults(BehaviorVersion::latest()).endpoint_url(ep_url.as_str());
                if let Some(creds) = creds {
                    loader = loader.credentials_provider(creds);
                }
                loader.load().await
            }
        };
        Ok(Client {
            client: ::aws_sdk_dynamodb::Client::new(&config),
        })
    }
    /// Produce a [Backend] implementation backed by the table named `name`
    pub fn table(&self, name: &str) -> Table {
        Table {
            client: self.client.clone(),
            name: name.to_owned(),
        }
    }
}

/// One DynamoDB table, viewed as a key-value store
pub struct Table {
    client: ::aws_sdk_dynamodb::Client,
    name: String,
}

fn string_attr(key: &str, name: &str, attr: &AttributeValue) -> Result<String> {
    match attr {
        AttributeValue::S(s) => Ok(s.clone()),
        _ => BadAttrTypeSnafu { key, name }.fail(),
    }
}

fn to_item(key: &str, mut attrs: HashMap<String, AttributeValue>) -> Result<Item> {
    let value = attrs
        .remove("value")
        .context(MissingAttrSnafu { key, name: "value" })
        .and_then(|attr| string_attr(key, "value", &attr))?;
    let metadata = match attrs.remove("metadata") {
        Some(AttributeValue::M(m)) => m
            .iter()
            .map(|(k, v)| Ok((k.clone(), string_attr(key, k, v)?)))
            .collect::<Result<BTreeMap<String, String>>>()?,
        Some(_) => {
            return BadAttrTypeSnafu {
                key,
                name: "metadata",
            }
            .fail();
        }
        None => BTreeMap::new(),
    };
    Ok(Item { value, metadata })
}

impl Table {
    fn put_builder(&self, key: &str, item: &Item) -> PutItemFluentBuilder {
        let mut builder = self
            .client
            .put_item()
            .table_name(&self.name)
            .item("pk", AttributeValue::S(key.to_owned()))
            .item("value", AttributeValue::S(item.value.clone()));
        if !item.metadata.is_empty() {
            builder = builder.item(
                "metadata",
                AttributeValue::M(
                    item.metadata
                        .iter()
                        .map(|(k, v)| (k.clone(), AttributeValue::S(v.clone())))
                        .collect(),
                ),
            );
        }
        builder
    }
}

/// Map a PutItem failure onto the storage error taxonomy
fn put_err<R>(key: &str, err: SdkError<PutItemError, R>) -> storage::Error
where
    R: std::fmt::Debug + Send + Sync + 'static,
{
    if matches!(&err, SdkError::ServiceError(inner)
                if matches!(inner.err(),
                            PutItemError::ProvisionedThroughputExceededException(_)
                            | PutItemError::RequestLimitExceeded(_)))
    {
        storage::QuotaExceededSnafu { key }.build()
    } else {
        storage::Error::new(err)
    }
}

#[async_trait]
impl Backend for Table {
    async fn get(&self, key: &str) -> storage::Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.name)
            .key("pk", AttributeValue::S(key.to_owned()))
            .consistent_read(true)
            .send()
            .await
            .map_err(storage::Error::new)?;
        output
            .item
            .map(|attrs| to_item(key, attrs))
            .transpose()
            .map_err(storage::Error::new)
    }

    async fn put(&self, key: &str, item: &Item) -> storage::Result<()> {
        debug!("put {key} into {}", self.name);
        self.put_builder(key, item)
            .send()
            .await
            .map_err(|err| put_err(key, err))?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        item: &Item,
    ) -> storage::Result<bool> {
        let builder = match expected {
            None => self
                .put_builder(key, item)
                .condition_expression("attribute_not_exists(pk)"),
            // "value" is a DynamoDB reserved word, hence the attribute name placeholder
            Some(expected) => self
                .put_builder(key, item)
                .condition_expression("#v = :expected")
                .expression_attribute_names("#v", "value")
                .expression_attribute_values(":expected", AttributeValue::S(expected.to_owned())),
        };
        // A failed condition comes back as a `ServiceError` wrapping a
        // `ConditionalCheckFailedException`; that's a lost race, not a failure.
        match builder.send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(inner))
                if matches!(
                    inner.err(),
                    PutItemError::ConditionalCheckFailedException(_)
                ) =>
            {
                debug!("conditional write to {key} in {} lost a race", self.name);
                Ok(false)
            }
            Err(err) => Err(put_err(key, err)),
        }
    }

    async fn delete(&self, key: &str) -> storage::Result<()> {
        self.client
            .delete_item()
            .table_name(&self.name)
            .key("pk", AttributeValue::S(key.to_owned()))
            .send()
            .await
            .map_err(storage::Error::new)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn item_conversion() {
        let mut attrs = HashMap::new();
        attrs.insert("pk".to_owned(), AttributeValue::S("latest".to_owned()));
        attrs.insert("value".to_owned(), AttributeValue::S("1.2.3".to_owned()));
        attrs.insert(
            "metadata".to_owned(),
            AttributeValue::M(HashMap::from([(
                "fetchedAt".to_owned(),
                AttributeValue::S("2025-01-01T00:00:00Z".to_owned()),
            )])),
        );
        let item = to_item("latest", attrs).unwrap();
        assert_eq!(item.value, "1.2.3");
        assert_eq!(
            item.metadata.get("fetchedAt").map(String::as_str),
            Some("2025-01-01T00:00:00Z")
        );

        let attrs = HashMap::from([("value".to_owned(), AttributeValue::N("1".to_owned()))]);
        assert!(matches!(
            to_item("k", attrs),
            Err(Error::BadAttrType { .. })
        ));
        assert!(matches!(
            to_item("k", HashMap::new()),
            Err(Error::MissingAttr { .. })
        ));
    }

    #[test]
    fn location_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            location: Location,
        }
        let w: Wrapper = toml::from_str("location = { region = \"us-east-1\" }").unwrap();
        assert!(matches!(w.location, Location::Region(r) if r == "us-east-1"));
        let w: Wrapper =
            toml::from_str("location = { endpoints = [\"http://localhost:8000\"] }").unwrap();
        assert!(matches!(w.location, Location::Endpoints(v) if v.len() == 1));
    }
}
