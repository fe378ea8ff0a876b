//! CRD installation
//!
//! The operator installs its own CRDs on startup using server-side apply so
//! the installed schema always matches the running binary.

use cloudengine_common::crd::{Cluster, Experiment, Template};
use cloudengine_common::FIELD_MANAGER;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "clusters.cloudengine.io",
            crd: Cluster::crd(),
        },
        CrdDef {
            name: "experiments.cloudengine.io",
            crd: Experiment::crd(),
        },
        CrdDef {
            name: "templates.cloudengine.io",
            crd: Template::crd(),
        },
    ]
}

/// Render every CRD as a multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for def in crds() {
        let doc = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))?;
        docs.push(doc);
    }
    Ok(docs.join("---\n"))
}

/// Install or update every CRD the controllers watch
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in crds() {
        tracing::info!("Installing {} CRD...", def.name);
        api.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    #[test]
    fn test_install_names_match_generated_crds() {
        for def in crds() {
            assert_eq!(def.crd.name_any(), def.name);
        }
    }

    #[test]
    fn test_manifests_contain_every_kind() {
        let yaml = crd_manifests().expect("render");
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 3);
        for kind in ["kind: Cluster", "kind: Experiment", "kind: Template"] {
            assert!(yaml.contains(kind), "missing {kind}");
        }
    }
}
