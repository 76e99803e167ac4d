// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Configured upstream blob servers.

use url::Url;

use super::{BlobSearch, Pointer};

#[derive(Debug, Clone, Default)]
pub struct UpstreamHosts {
    hosts: Vec<Url>,
}

impl UpstreamHosts {
    pub fn new(hosts: Vec<Url>) -> Self {
        Self { hosts }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// `{host}/{hash}` for each host, in configuration order.
    pub fn pointers(&self, search: &BlobSearch) -> Vec<Pointer> {
        self.hosts
            .iter()
            .filter_map(|host| {
                let mut base = host.clone();
                if !base.path().ends_with('/') {
                    let path = format!("{}/", base.path());
                    base.set_path(&path);
                }
                base.join(search.hash.as_str()).ok()
            })
            .map(|location| Pointer {
                location,
                mime_type: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlobHash;

    #[test]
    fn builds_pointers_in_order() {
        let hosts = UpstreamHosts::new(vec![
            Url::parse("https://cdn.one.example").unwrap(),
            Url::parse("https://two.example/blobs").unwrap(),
        ]);
        let hash = BlobHash::of(b"abc");
        let pointers = hosts.pointers(&BlobSearch::new(hash.clone()));

        assert_eq!(
            pointers[0].location.as_str(),
            format!("https://cdn.one.example/{hash}")
        );
        assert_eq!(
            pointers[1].location.as_str(),
            format!("https://two.example/blobs/{hash}")
        );
    }
}
