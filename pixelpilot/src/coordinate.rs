use crate::descriptor::ActionDescriptor;
use crate::detection::{DetectionResult, LocatorMethod};
use crate::errors::LocateError;
use crate::locator::{AttemptOptions, Locator};
use crate::screenshot::Screenshot;

/// Method of last resort: the descriptor's pre-configured point.
///
/// Confidence is always 1.0 because nothing is being sensed. The point must
/// still lie on the captured screen.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoordinateResolver;

impl Locator for CoordinateResolver {
    fn method(&self) -> LocatorMethod {
        LocatorMethod::Coordinate
    }

    fn applies_to(&self, descriptor: &ActionDescriptor) -> bool {
        descriptor.fallback_point().is_some()
    }

    fn attempt(
        &self,
        screen: &Screenshot,
        descriptor: &ActionDescriptor,
        options: &AttemptOptions,
    ) -> Result<DetectionResult, LocateError> {
        let base = descriptor.fallback_point().ok_or_else(|| {
            LocateError::InvalidDescriptor("coordinate resolver needs fallback_point".to_string())
        })?;
        let (dx, dy) = options.point_offset;
        let point = base.offset(dx, dy);
        if !screen.bounds().contains(point) {
            return Err(LocateError::DetectionNotFound(format!(
                "point {point} lies outside the {}x{} screen",
                screen.width(),
                screen.height()
            )));
        }
        Ok(DetectionResult::at_point(LocatorMethod::Coordinate, point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Point;
    use crate::tests::fakes::blank_screen;

    #[test]
    fn returns_configured_point_with_full_confidence() {
        let descriptor = ActionDescriptor::for_point(Point::new(120, 45));
        let result = CoordinateResolver
            .attempt(&blank_screen(200, 100), &descriptor, &AttemptOptions::default())
            .unwrap();
        assert!(result.found);
        assert_eq!(result.location, Some(Point::new(120, 45)));
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.method, LocatorMethod::Coordinate);
    }

    #[test]
    fn applies_jitter_offset() {
        let descriptor = ActionDescriptor::for_point(Point::new(50, 50));
        let options = AttemptOptions {
            point_offset: (-5, 5),
            ..AttemptOptions::default()
        };
        let result = CoordinateResolver
            .attempt(&blank_screen(100, 100), &descriptor, &options)
            .unwrap();
        assert_eq!(result.location, Some(Point::new(45, 55)));
    }

    #[test]
    fn off_screen_point_is_not_found() {
        let descriptor = ActionDescriptor::for_point(Point::new(300, 10));
        let err = CoordinateResolver
            .attempt(&blank_screen(200, 100), &descriptor, &AttemptOptions::default())
            .unwrap_err();
        assert!(matches!(err, LocateError::DetectionNotFound(_)));
    }
}
