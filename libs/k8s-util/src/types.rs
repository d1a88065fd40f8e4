use std::any::type_name;

#[inline]
pub fn short_type_name<K>() -> Option<&'static str> {
    let type_name = type_name::<K>();
    type_name.split("::").last()
}

#[cfg(test)]
mod tests {
    use super::short_type_name;

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<i32>(), Some("i32"));
        assert_eq!(
            short_type_name::<k8s_openapi::api::core::v1::Secret>(),
            Some("Secret")
        );
    }
}
