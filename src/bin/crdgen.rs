use anyhow::Context;
use kube::CustomResourceExt;
use kube_combo::crd::{IpsecConn, KeepAlived, VpnGw};

fn main() -> anyhow::Result<()> {
    let crds = [VpnGw::crd(), KeepAlived::crd(), IpsecConn::crd()];
    let documents = crds
        .iter()
        .map(|crd| {
            serde_yaml::to_string(crd)
                .with_context(|| format!("serializing CRD {}", crd.metadata.name.as_deref().unwrap_or("?")))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    print!("{}", documents.join("---\n"));
    Ok(())
}
