use crate::catalog::ObjectTypeInfo;
use crate::settings::{ImportSettings, ProcessObjectType};

/// Effective action for one top-level object.
///
/// Excluded types are never processed. A type with a selection entry
/// processes only the selected code names; unselected objects of a type that
/// can be bound to sites are still attached to the target site. Types
/// without an entry follow the settings default, where `Selected` with
/// nothing selected means nothing.
pub fn process_type(
    settings: &ImportSettings,
    info: &ObjectTypeInfo,
    code_name: Option<&str>,
) -> ProcessObjectType {
    let selection = &settings.selection;
    if selection.excluded_types.contains(&info.name) {
        return ProcessObjectType::None;
    }

    match selection.objects.get(&info.name) {
        Some(selected) => {
            let picked = code_name.is_some_and(|name| {
                selected
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(name))
            });
            if picked {
                ProcessObjectType::All
            } else if info.site_binding_type.is_some() && settings.site_id.is_some() {
                ProcessObjectType::SiteBinding
            } else {
                ProcessObjectType::None
            }
        }
        None => match settings.default_process_type {
            ProcessObjectType::Selected => ProcessObjectType::None,
            other => other,
        },
    }
}

/// Whether anything of the type can be processed at all.
pub fn type_is_processed(settings: &ImportSettings, info: &ObjectTypeInfo) -> bool {
    if settings.selection.excluded_types.contains(&info.name) {
        return false;
    }
    match settings.selection.objects.get(&info.name) {
        Some(selected) => !selected.is_empty() || info.site_binding_type.is_some(),
        None => !matches!(
            settings.default_process_type,
            ProcessObjectType::None | ProcessObjectType::Selected
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::object_type;

    fn settings() -> ImportSettings {
        let mut settings = ImportSettings::new("/tmp/pkg");
        settings.site_id = Some(1);
        settings
    }

    #[test]
    fn excluded_types_are_never_processed() {
        let mut settings = settings();
        settings.selection.exclude("cms.role");
        let info = object_type("cms.role", "Role");
        assert_eq!(process_type(&settings, &info, Some("Editors")), ProcessObjectType::None);
        assert!(!type_is_processed(&settings, &info));
    }

    #[test]
    fn selected_code_names_get_full_processing() {
        let mut settings = settings();
        settings.selection.select("cms.role", "Editors");
        let mut info = object_type("cms.role", "Role");
        assert_eq!(process_type(&settings, &info, Some("editors")), ProcessObjectType::All);
        assert_eq!(process_type(&settings, &info, Some("Authors")), ProcessObjectType::None);

        info.site_binding_type = Some("cms.rolesite".into());
        assert_eq!(
            process_type(&settings, &info, Some("Authors")),
            ProcessObjectType::SiteBinding
        );
    }

    #[test]
    fn unlisted_types_follow_the_default() {
        let mut settings = settings();
        let info = object_type("cms.role", "Role");
        assert_eq!(process_type(&settings, &info, None), ProcessObjectType::All);

        settings.default_process_type = ProcessObjectType::Selected;
        assert_eq!(process_type(&settings, &info, Some("x")), ProcessObjectType::None);
        assert!(!type_is_processed(&settings, &info));
    }
}
