use dexop_operator::dex::crd::{DexConfiguration, LdapConnector};

use kube::CustomResourceExt;

fn main() {
    for crd in [DexConfiguration::crd(), LdapConnector::crd()] {
        // safe unwrap: we know CRD is serializable
        print!("---\n{}\n", serde_yaml::to_string(&crd).unwrap());
    }
}
