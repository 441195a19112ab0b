// Ordered record of registration resources, unwound newest-first.
use crate::core::identity::{BindingId, ClassId, Identity};
use crate::core::platform::Platform;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Acquired {
    Region(Identity),
    Class(ClassId),
    Binding(BindingId),
    Node { class: ClassId, identity: Identity },
}

#[derive(Debug, Default)]
pub(crate) struct Acquisitions {
    stack: Vec<Acquired>,
}

impl Acquisitions {
    pub(crate) fn push(&mut self, acquired: Acquired) {
        self.stack.push(acquired);
    }

    pub(crate) fn len(&self) -> usize {
        self.stack.len()
    }

    /// Releases everything in reverse order of acquisition, leaving the stack empty.
    pub(crate) fn unwind<P: Platform + ?Sized>(&mut self, platform: &P) {
        while let Some(acquired) = self.stack.pop() {
            tracing::debug!(?acquired, "releasing registration resource");
            match acquired {
                Acquired::Node { class, identity } => platform.destroy_node(class, identity),
                Acquired::Binding(binding) => platform.del_binding(binding),
                Acquired::Class(class) => platform.destroy_class(class),
                Acquired::Region(identity) => platform.free_region(identity),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Acquired, Acquisitions};
    use crate::core::platform::{MemoryPlatform, Platform};

    #[test]
    fn unwind_runs_in_reverse_and_empties_the_stack() {
        let platform = MemoryPlatform::new();
        let mut acquisitions = Acquisitions::default();

        let identity = platform.alloc_region("dev", 0).expect("region");
        acquisitions.push(Acquired::Region(identity));
        let class = platform.create_class("cls").expect("class");
        acquisitions.push(Acquired::Class(class));
        let binding = platform.add_binding(identity).expect("binding");
        acquisitions.push(Acquired::Binding(binding));
        platform.create_node(class, identity, "dev").expect("node");
        acquisitions.push(Acquired::Node { class, identity });
        assert_eq!(acquisitions.len(), 4);

        acquisitions.unwind(&platform);
        assert_eq!(acquisitions.len(), 0);
        assert_eq!(
            platform.journal()[4..],
            ["destroy_node", "del_binding", "destroy_class", "free_region"]
        );

        acquisitions.unwind(&platform);
        assert_eq!(platform.stats().double_frees, 0);
        assert_eq!(platform.stats().live(), 0);
    }
}
