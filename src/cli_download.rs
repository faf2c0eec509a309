//! The cluster-scoped `ConsoleCLIDownload` advertising the `kn` binaries
//! served behind the download route.
//!
//! The descriptor lives outside the owner's namespace, so it is tied to its
//! owner through the stamped ownership annotations instead of an owner
//! reference.

use serde_json::json;

use crate::{
    apply::same_content,
    config::CLI_DOWNLOADS_NAME,
    manifest::transform::{self, Pipeline, Transform},
    object::{gvk, Kind, Object, QualifiedName, OWNER_NAMESPACE_ANNOTATION, OWNER_NAME_ANNOTATION},
    store::{self, ObjectStore},
};

const DISPLAY_NAME: &str = "kn - OpenShift Serverless Command Line Interface (CLI)";
const DESCRIPTION: &str = "The OpenShift Serverless client `kn` is a CLI tool that allows you to fully manage OpenShift Serverless Serving and Eventing resources without writing a single line of YAML.";

/// Link text and path below the base URL, one per platform.
const LINKS: [(&str, &str); 3] = [
    ("Download kn for Linux", "amd64/linux/kn-linux-amd64.tar.gz"),
    ("Download kn for macOS", "amd64/macos/kn-macos-amd64.tar.gz"),
    ("Download kn for Windows", "amd64/windows/kn-windows-amd64.zip"),
];

const SECURE_SCHEME: &str = "https://";

/// The error type returned by [`upsert`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to build {CLI_DOWNLOADS_NAME}: {0}")]
    Build(#[from] transform::Error),
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Qualifies `host` with the secure scheme. An empty host stays empty.
pub fn secure(host: &str) -> String {
    if host.is_empty() || host.starts_with(SECURE_SCHEME) {
        host.to_owned()
    } else {
        format!("{SECURE_SCHEME}{host}")
    }
}

/// Fills `spec.links` with the download links below `base_url`.
pub fn populate_links(base_url: &str) -> impl Transform {
    let links: Vec<_> = LINKS
        .iter()
        .map(|(text, path)| json!({ "text": text, "href": format!("{base_url}/{path}") }))
        .collect();
    move |obj: &mut Object| -> Result<(), transform::Error> {
        obj.data_mut()["spec"]["links"] = serde_json::Value::Array(links.clone());
        Ok(())
    }
}

fn key() -> QualifiedName {
    QualifiedName::cluster(CLI_DOWNLOADS_NAME)
}

/// The descriptor for `host`, stamped with `owner`.
pub fn desired(host: &str, owner: &QualifiedName) -> Result<Object, transform::Error> {
    let mut obj = Object::new(gvk::console_cli_download(), CLI_DOWNLOADS_NAME);
    obj.data_mut()["spec"] = json!({
        "displayName": DISPLAY_NAME,
        "description": DESCRIPTION,
    });
    Pipeline::new()
        .with(transform::stamp_owner(owner))
        .with_for(Kind::ConsoleCliDownload, populate_links(&secure(host)))
        .run(&mut obj)?;
    Ok(obj)
}

/// Creates the descriptor for `host`, or brings the existing one in line.
pub async fn upsert<S: ObjectStore>(
    store: &S,
    host: &str,
    owner: &QualifiedName,
) -> Result<Object, Error> {
    let desired = desired(host, owner)?;
    let live = match store.get_opt(desired.gvk(), &key()).await? {
        Some(live) => live,
        None => match store.create(&desired).await {
            Ok(created) => {
                log::info!("Created ConsoleCLIDownload {CLI_DOWNLOADS_NAME} for {owner}");
                return Ok(created);
            }
            Err(err) if err.is_already_exists() => store.get(desired.gvk(), &key()).await?,
            Err(err) => return Err(err.into()),
        },
    };
    if same_content(&desired, &live) {
        return Ok(live);
    }

    let mut next = live;
    next.data_mut()["spec"] = desired.data()["spec"].clone();
    for annotation in [OWNER_NAME_ANNOTATION, OWNER_NAMESPACE_ANNOTATION] {
        if let Some(value) = desired.annotations().get(annotation) {
            next.set_annotation(annotation, value);
        }
    }
    let updated = store.update(&next).await?;
    log::info!("Updated ConsoleCLIDownload {CLI_DOWNLOADS_NAME} for {owner}");
    Ok(updated)
}

/// Deletes the descriptor unless another owner stamped it. Returns whether
/// anything was deleted; a descriptor that never existed is not an error.
pub async fn teardown<S: ObjectStore>(store: &S, owner: &QualifiedName) -> Result<bool, store::Error> {
    let gvk = gvk::console_cli_download();
    let Some(live) = store.get_opt(&gvk, &key()).await? else {
        return Ok(false);
    };
    if live.is_foreign_to(owner) {
        log::warn!(
            "Not deleting ConsoleCLIDownload {CLI_DOWNLOADS_NAME}: owned by {:?}, not {owner}",
            live.owner()
        );
        return Ok(false);
    }
    match store.delete(&gvk, &key()).await {
        Ok(()) => {
            log::info!("Deleted ConsoleCLIDownload {CLI_DOWNLOADS_NAME}");
            Ok(true)
        }
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Operation};

    fn owner() -> QualifiedName {
        QualifiedName::namespaced("knative-serving", "knative-serving")
    }

    fn hrefs(obj: &Object) -> Vec<String> {
        obj.data()["spec"]["links"]
            .as_array()
            .unwrap()
            .iter()
            .map(|link| link["href"].as_str().unwrap().to_owned())
            .collect()
    }

    #[test]
    fn secure_normalizes_hosts() {
        assert_eq!(secure(""), "");
        assert_eq!(secure("example.com"), "https://example.com");
        assert_eq!(secure("https://example.com"), "https://example.com");
    }

    #[test]
    fn desired_descriptor_links_every_platform() {
        let obj = desired("foo.example.com", &owner()).unwrap();
        assert_eq!(obj.namespace(), None);
        assert_eq!(obj.owner(), Some(owner()));
        assert_eq!(obj.data()["spec"]["displayName"], DISPLAY_NAME);
        assert_eq!(
            hrefs(&obj),
            vec![
                "https://foo.example.com/amd64/linux/kn-linux-amd64.tar.gz",
                "https://foo.example.com/amd64/macos/kn-macos-amd64.tar.gz",
                "https://foo.example.com/amd64/windows/kn-windows-amd64.zip",
            ]
        );
        assert_eq!(obj.data()["spec"]["links"][1]["text"], "Download kn for macOS");
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_on_host_change() {
        let store = MemoryStore::new();
        let created = upsert(&store, "a.example.com", &owner()).await.unwrap();
        assert_eq!(hrefs(&created)[0], "https://a.example.com/amd64/linux/kn-linux-amd64.tar.gz");

        let same = upsert(&store, "a.example.com", &owner()).await.unwrap();
        assert_eq!(same, created);

        let updated = upsert(&store, "b.example.com", &owner()).await.unwrap();
        assert_eq!(hrefs(&updated)[2], "https://b.example.com/amd64/windows/kn-windows-amd64.zip");
        assert_eq!(updated.meta().uid, created.meta().uid);
        assert_eq!(store.objects(&gvk::console_cli_download()).len(), 1);
    }

    #[tokio::test]
    async fn upsert_absorbs_create_race() {
        let store = MemoryStore::new();
        store.insert(desired("old.example.com", &owner()).unwrap());
        // the first read misses the descriptor a concurrent writer just created
        store.fail_next_with(
            Operation::Get,
            "ConsoleCLIDownload",
            store::Error::NotFound {
                kind: "ConsoleCLIDownload".to_owned(),
                key: key(),
            },
        );

        let obj = upsert(&store, "new.example.com", &owner()).await.unwrap();
        assert_eq!(hrefs(&obj)[0], "https://new.example.com/amd64/linux/kn-linux-amd64.tar.gz");
        let creates = store
            .calls()
            .iter()
            .filter(|(op, _, _)| *op == Operation::Create)
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn teardown_without_descriptor_succeeds() {
        let store = MemoryStore::new();
        assert!(!teardown(&store, &owner()).await.unwrap());
    }

    #[tokio::test]
    async fn teardown_respects_other_owners() {
        let store = MemoryStore::new();
        upsert(&store, "a.example.com", &owner()).await.unwrap();

        let stranger = QualifiedName::namespaced("other", "knative-serving");
        assert!(!teardown(&store, &stranger).await.unwrap());
        assert_eq!(store.objects(&gvk::console_cli_download()).len(), 1);

        assert!(teardown(&store, &owner()).await.unwrap());
        assert!(store.objects(&gvk::console_cli_download()).is_empty());
    }
}
