// Pod density is bounded by the number of ENIs and IPv4 addresses per ENI of
// each instance type. Sorted by instance type.
const MAX_PODS_PER_INSTANCE_TYPE: &[(&str, u32)] = &[
    ("c5.2xlarge", 58),
    ("c5.4xlarge", 234),
    ("c5.large", 29),
    ("c5.xlarge", 58),
    ("g3.4xlarge", 234),
    ("g4dn.xlarge", 29),
    ("m4.large", 20),
    ("m4.xlarge", 58),
    ("m5.12xlarge", 234),
    ("m5.24xlarge", 737),
    ("m5.2xlarge", 58),
    ("m5.4xlarge", 234),
    ("m5.large", 29),
    ("m5.xlarge", 58),
    ("p2.xlarge", 58),
    ("p3.2xlarge", 58),
    ("p3.8xlarge", 234),
    ("r5.large", 29),
    ("r5.xlarge", 58),
    ("t2.large", 35),
    ("t2.medium", 17),
    ("t2.micro", 4),
    ("t2.small", 11),
    ("t3.2xlarge", 58),
    ("t3.large", 35),
    ("t3.medium", 17),
    ("t3.micro", 4),
    ("t3.small", 11),
    ("t3.xlarge", 58),
];

/// Maximum number of pods the instance type's networking can address
pub fn max_pods(instance_type: &str) -> Option<u32> {
    MAX_PODS_PER_INSTANCE_TYPE
        .binary_search_by(|(t, _)| (*t).cmp(instance_type))
        .ok()
        .map(|idx| MAX_PODS_PER_INSTANCE_TYPE[idx].1)
}
