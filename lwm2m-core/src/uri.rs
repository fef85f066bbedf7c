use crate::error::{Lwm2mError, Lwm2mResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type ObjectId = u16;
pub type InstanceId = u16;
pub type ResourceId = u16;
pub type ResourceInstanceId = u16;
pub type ShortServerId = u16;

/// Reserved identifier meaning "unspecified" on the wire
pub const ID_INVALID: u16 = u16::MAX;

/// Object/instance/resource path addressing a node of the data model
///
/// Paths are hierarchical: a resource is only addressable below an
/// instance, and a resource instance only below a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uri {
    pub object: ObjectId,
    pub instance: Option<InstanceId>,
    pub resource: Option<ResourceId>,
    pub resource_instance: Option<ResourceInstanceId>,
}

impl Uri {
    /// Path to an object
    pub fn object(object: ObjectId) -> Self {
        Self {
            object,
            instance: None,
            resource: None,
            resource_instance: None,
        }
    }

    /// Path to an object instance
    pub fn instance(object: ObjectId, instance: InstanceId) -> Self {
        Self {
            instance: Some(instance),
            ..Self::object(object)
        }
    }

    /// Path to a resource
    pub fn resource(object: ObjectId, instance: InstanceId, resource: ResourceId) -> Self {
        Self {
            resource: Some(resource),
            ..Self::instance(object, instance)
        }
    }

    /// Path to a resource instance
    pub fn resource_instance(
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        resource_instance: ResourceInstanceId,
    ) -> Self {
        Self {
            resource_instance: Some(resource_instance),
            ..Self::resource(object, instance, resource)
        }
    }

    /// Parse a path of the form "/3", "/3/0", "/3/0/1" or "/3/0/6/1"
    ///
    /// # Errors
    /// Returns `BadRequest` for empty paths, more than four segments,
    /// non-numeric segments and the reserved identifier 65535.
    pub fn parse(s: &str) -> Lwm2mResult<Self> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        if trimmed.is_empty() {
            return Err(Lwm2mError::bad_request("empty path"));
        }

        let mut ids = Vec::with_capacity(4);
        for part in trimmed.split('/') {
            let id = part
                .parse::<u16>()
                .map_err(|_| Lwm2mError::BadRequest(format!("invalid path segment: {}", part)))?;
            if id == ID_INVALID {
                return Err(Lwm2mError::BadRequest(format!("reserved identifier in path: {}", s)));
            }
            ids.push(id);
        }
        if ids.len() > 4 {
            return Err(Lwm2mError::BadRequest(format!("path too deep: {}", s)));
        }

        Ok(Self {
            object: ids[0],
            instance: ids.get(1).copied(),
            resource: ids.get(2).copied(),
            resource_instance: ids.get(3).copied(),
        })
    }

    /// Number of specified path segments (1-4)
    pub fn depth(&self) -> usize {
        1 + self.instance.is_some() as usize
            + self.resource.is_some() as usize
            + self.resource_instance.is_some() as usize
    }

    /// Whether `other` lies at or below this path
    pub fn contains(&self, other: &Uri) -> bool {
        fn covers(mine: Option<u16>, theirs: Option<u16>) -> bool {
            match (mine, theirs) {
                (None, _) => true,
                (Some(a), Some(b)) => a == b,
                (Some(_), None) => false,
            }
        }
        self.object == other.object
            && covers(self.instance, other.instance)
            && (self.instance.is_none() || covers(self.resource, other.resource))
            && (self.resource.is_none()
                || covers(self.resource_instance, other.resource_instance))
    }

    /// Whether two paths overlap in either direction
    pub fn overlaps(&self, other: &Uri) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl FromStr for Uri {
    type Err = Lwm2mError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uri::parse(s)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.object)?;
        for id in [self.instance, self.resource, self.resource_instance]
            .into_iter()
            .flatten()
        {
            write!(f, "/{}", id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_parse() {
        let uri = Uri::parse("/3/0/6/1").unwrap();
        assert_eq!(uri, Uri::resource_instance(3, 0, 6, 1));
        assert_eq!(uri.depth(), 4);

        let uri: Uri = "1/2".parse().unwrap();
        assert_eq!(uri, Uri::instance(1, 2));
    }

    #[test]
    fn test_uri_parse_rejects_garbage() {
        assert!(Uri::parse("").is_err());
        assert!(Uri::parse("/a/0").is_err());
        assert!(Uri::parse("/3/65535").is_err());
        assert!(Uri::parse("/1/2/3/4/5").is_err());
    }

    #[test]
    fn test_uri_display() {
        assert_eq!(Uri::resource(3303, 1, 5700).to_string(), "/3303/1/5700");
        assert_eq!(Uri::object(1).to_string(), "/1");
    }

    #[test]
    fn test_uri_contains() {
        let object = Uri::object(3);
        let instance = Uri::instance(3, 0);
        let resource = Uri::resource(3, 0, 9);

        assert!(object.contains(&resource));
        assert!(instance.contains(&resource));
        assert!(!resource.contains(&instance));
        assert!(!Uri::instance(3, 1).contains(&resource));
        assert!(resource.overlaps(&object));
    }
}
