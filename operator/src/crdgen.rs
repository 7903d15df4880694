use kube::CustomResourceExt;

use pipebench_operator::dataset::DataSet;
use pipebench_operator::experiment::Experiment;
use pipebench_operator::lgen::TestRun;
use pipebench_operator::loadpattern::LoadPattern;
use pipebench_operator::pipeline::Pipeline;

fn main() {
    print!("{}", serde_yaml::to_string(&Experiment::crd()).unwrap());
    print!("---");
    print!("{}", serde_yaml::to_string(&Pipeline::crd()).unwrap());
    print!("---");
    print!("{}", serde_yaml::to_string(&DataSet::crd()).unwrap());
    print!("---");
    print!("{}", serde_yaml::to_string(&LoadPattern::crd()).unwrap());
    print!("---");
    print!("{}", serde_yaml::to_string(&TestRun::crd()).unwrap());
}
