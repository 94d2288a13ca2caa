//! Prints the CRD manifests owned by the VM DHCP controller as a YAML stream.

use crds::{IPPool, VirtualMachineNetworkConfig};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("---\n{}", serde_yaml::to_string(&IPPool::crd())?);
    print!("---\n{}", serde_yaml::to_string(&VirtualMachineNetworkConfig::crd())?);
    Ok(())
}
