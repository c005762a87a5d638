use kube::CustomResourceExt;
use std::fs;
use vault_operator_types::*;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/vault.security.coreos.com_vaultservice_crd.yaml",
        serde_yaml::to_string(&VaultService::crd()).unwrap(),
    )
    .unwrap();
}
