use kube::CustomResourceExt;

use gardener_deployers::resources::{Etcd, Hvpa, ManagedResource, VerticalPodAutoscaler};

fn main() -> anyhow::Result<()> {
    let resources = [
        ManagedResource::crd(),
        Etcd::crd(),
        Hvpa::crd(),
        VerticalPodAutoscaler::crd(),
    ];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource)?);
    }
    Ok(())
}
