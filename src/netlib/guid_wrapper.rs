use std::fmt;
use uuid::Uuid;

/// A wrapper around `Uuid` to represent the GUID requested for a new adapter.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuidWrapper(Uuid);

impl GuidWrapper {
    /// Creates a new `GuidWrapper` with a nil `Uuid`.
    pub fn new() -> Self {
        GuidWrapper(Uuid::nil())
    }

    /// Creates a new `GuidWrapper` from the provided `Uuid`.
    pub fn from_uuid(uuid: Uuid) -> Self {
        GuidWrapper(uuid)
    }

    /// Returns the wrapped `Uuid`.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Converts the wrapped `Uuid` to a hyphenated uppercase string, the registry form of a GUID.
    pub fn to_hyphenated_upper_string(&self) -> String {
        self.0.hyphenated().to_string().to_uppercase()
    }

    /// Converts the wrapped `Uuid` to a Win32 `GUID` with the same field values.
    #[cfg(windows)]
    pub fn to_guid(&self) -> windows::core::GUID {
        windows::core::GUID::from_u128(self.0.as_u128())
    }
}

impl From<Uuid> for GuidWrapper {
    fn from(uuid: Uuid) -> Self {
        GuidWrapper::from_uuid(uuid)
    }
}

/// Formats the wrapped `Uuid` in braces, as Windows displays interface GUIDs.
impl fmt::Display for GuidWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.to_hyphenated_upper_string())
    }
}

#[cfg(test)]
mod tests {
    use super::GuidWrapper;
    use uuid::Uuid;

    #[test]
    fn test_new() {
        let guid_wrapper = GuidWrapper::new();
        assert_eq!(guid_wrapper.0, Uuid::nil());
    }

    #[test]
    fn test_from_uuid() {
        let uuid = Uuid::new_v4();
        let guid_wrapper = GuidWrapper::from_uuid(uuid);
        assert_eq!(guid_wrapper.as_uuid(), &uuid);
    }

    #[test]
    fn test_to_hyphenated_upper_string() {
        let uuid = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let guid_wrapper = GuidWrapper::from_uuid(uuid);
        let guid_str = guid_wrapper.to_hyphenated_upper_string();
        assert_eq!(guid_str, "550E8400-E29B-41D4-A716-446655440000");
    }

    #[test]
    fn test_display() {
        let uuid = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let guid_wrapper = GuidWrapper::from_uuid(uuid);
        assert_eq!(
            guid_wrapper.to_string(),
            "{550E8400-E29B-41D4-A716-446655440000}"
        );
    }
}
